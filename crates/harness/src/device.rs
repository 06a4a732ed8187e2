use std::sync::{Arc, Mutex};

use contactsave_core::{
    Account, CardId, ContactId, DataRow, FieldDeltaModel, GroupId, PhoneType, RawContactDelta, RawContactId,
    RawContactSnapshot,
};
use contactsave_engine::{ContactSaver, PhotoSink, SaveConfig, SaveRequest, SaveResult};
use contactsave_storage::{CardStore, ContactRecord, ContactStore, SqliteProvider};

use crate::faults::{FaultyStore, FlakyCard};

pub type PhotoLog = Arc<Mutex<Vec<(RawContactId, String)>>>;

/// Photo sink that records what it was given. Photos whose location starts
/// with `bad:` are rejected.
#[derive(Clone, Default)]
pub struct RecordingPhotos {
    pub log: PhotoLog,
}

impl PhotoSink for RecordingPhotos {
    fn save_photo(&mut self, raw_contact_id: RawContactId, photo: &str) -> Result<(), String> {
        if photo.starts_with("bad:") {
            return Err(format!("cannot decode {photo}"));
        }
        self.log
            .lock()
            .map_err(|_| "photo log poisoned".to_string())?
            .push((raw_contact_id, photo.to_string()));
        Ok(())
    }
}

/// A provider plus one card on SIM1, wired into a [`ContactSaver`].
pub struct TestDevice {
    pub saver: ContactSaver<FaultyStore>,
    pub card: FlakyCard,
    pub photos: PhotoLog,
}

impl TestDevice {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Self::with_config(SaveConfig::default())
    }

    pub fn with_config(config: SaveConfig) -> Result<Self, Box<dyn std::error::Error>> {
        crate::init_tracing();
        let card = FlakyCard::default();
        let photos = RecordingPhotos::default();
        let log = photos.log.clone();
        let saver = ContactSaver::new(FaultyStore::new(SqliteProvider::open_in_memory()?), config)
            .with_card(CardId::Sim1, card.clone())
            .with_photo_sink(photos);
        Ok(Self {
            saver,
            card,
            photos: log,
        })
    }

    pub fn card_account() -> Account {
        Account::card(CardId::Sim1)
    }

    pub fn store(&self) -> &FaultyStore {
        self.saver.store()
    }

    pub fn store_mut(&mut self) -> &mut FaultyStore {
        self.saver.store_mut()
    }

    pub fn save(&mut self, model: FieldDeltaModel) -> Result<SaveResult, Box<dyn std::error::Error>> {
        Ok(self.saver.save(SaveRequest::new(model))?)
    }

    fn insert(&mut self, account: Account, name: &str, phones: &[(&str, PhoneType)]) -> Result<RawContactId, Box<dyn std::error::Error>> {
        let mut delta = RawContactDelta::insert(account).with_data(DataRow::name(name));
        for (number, phone_type) in phones {
            delta = delta.with_data(DataRow::phone(number, *phone_type));
        }
        let result = self.save(FieldDeltaModel::single(delta))?;
        result
            .inserted_raw_contact_id
            .ok_or_else(|| "save inserted no raw contact".into())
    }

    pub fn insert_local(&mut self, name: &str, phones: &[(&str, PhoneType)]) -> Result<RawContactId, Box<dyn std::error::Error>> {
        self.insert(Account::local(), name, phones)
    }

    pub fn insert_card_contact(&mut self, name: &str, number: &str) -> Result<RawContactId, Box<dyn std::error::Error>> {
        self.insert(Self::card_account(), name, &[(number, PhoneType::Mobile)])
    }

    pub fn snapshot(&self, id: RawContactId) -> Result<RawContactSnapshot, Box<dyn std::error::Error>> {
        self.store()
            .raw_contact(id)?
            .ok_or_else(|| format!("raw contact {id} missing").into())
    }

    /// An edit session opened on the raw contact's current state.
    pub fn edit(&self, id: RawContactId) -> Result<RawContactDelta, Box<dyn std::error::Error>> {
        Ok(RawContactDelta::from_snapshot(self.snapshot(id)?))
    }

    pub fn contact_of(&self, id: RawContactId) -> Result<ContactRecord, Box<dyn std::error::Error>> {
        let info = self
            .store()
            .raw_contact_info(id)?
            .ok_or_else(|| format!("raw contact {id} missing"))?;
        let contact_id: ContactId = info.contact_id.ok_or("raw contact has no contact")?;
        self.store()
            .contact(contact_id)?
            .ok_or_else(|| format!("contact {contact_id} missing").into())
    }

    pub fn create_group(&mut self, account: &Account, label: &str) -> Result<GroupId, Box<dyn std::error::Error>> {
        Ok(self.saver.create_group(account, label, &[])?)
    }

    pub fn card_record(&self, id: RawContactId) -> Result<Option<contactsave_storage::CardRecord>, Box<dyn std::error::Error>> {
        let Some(slot) = self.store().raw_contact_info(id)?.and_then(|info| info.card_slot) else {
            return Ok(None);
        };
        Ok(self.card.read(slot)?)
    }
}
