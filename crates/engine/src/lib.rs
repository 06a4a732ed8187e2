pub mod applier;
pub mod card_sync;
pub mod config;
pub mod diff;
pub mod error;
pub mod groups;
pub mod join;
pub mod service;

pub use applier::{Persisted, persist_with_retry};
pub use card_sync::{CardSync, CardSyncOutcome, CardSyncState};
pub use config::SaveConfig;
pub use diff::{DiffOptions, build_diff};
pub use error::EngineError;
pub use service::{Completion, Request, Response, SaveService, SaveServiceHandle};

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use contactsave_core::{
    Account, CardId, ContactId, ContactRef, DataKind, DataValues, FieldDeltaModel, FieldValue, GroupId,
    RawContactId, columns,
};
use contactsave_storage::schema::{contacts as contact_cols, data as data_cols, groups as group_cols, raw_contacts as rc};
use contactsave_storage::{CardStore, ContactStore, ProviderOp, Target};

use crate::applier::apply;
use crate::card_sync::on_card_thread;

/// Receives photos once their raw contact exists.
pub trait PhotoSink: Send {
    fn save_photo(&mut self, raw_contact_id: RawContactId, photo: &str) -> Result<(), String>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveRequest {
    pub model: FieldDeltaModel,
    /// Resolve the result through the profile contact.
    pub is_profile: bool,
    /// Raw contact id -> photo location. A negative key stands for the raw
    /// contact this save inserts.
    pub updated_photos: BTreeMap<i64, String>,
}

impl SaveRequest {
    pub fn new(model: FieldDeltaModel) -> Self {
        Self {
            model,
            ..Self::default()
        }
    }

    pub fn profile(mut self) -> Self {
        self.is_profile = true;
        self
    }

    pub fn with_photo(mut self, key: i64, photo: impl Into<String>) -> Self {
        self.updated_photos.insert(key, photo.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResult {
    /// False when a photo could not be stored after the contact was saved.
    pub succeeded: bool,
    pub contact: Option<ContactRef>,
    pub inserted_raw_contact_id: Option<RawContactId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MembershipChange {
    Add(GroupId),
    Remove(GroupId),
}

/// Pulls group membership edits out of the model; they are reconciled after
/// the main batch commits. `None` owner means the raw contact being inserted.
fn take_group_memberships(model: &mut FieldDeltaModel) -> Vec<(Option<RawContactId>, MembershipChange)> {
    let mut changes = Vec::new();
    for delta in model.raw_contacts_mut() {
        if delta.is_delete() {
            continue;
        }
        let owner = delta.raw_contact_id();
        let entries = std::mem::take(delta.data_mut());
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.kind() != &DataKind::GroupMembership {
                kept.push(entry);
                continue;
            }
            let before = entry.before().and_then(|row| row.group_id());
            let after = entry.after().and_then(|row| row.group_id());
            if entry.is_delete() {
                if let Some(group) = before {
                    changes.push((owner, MembershipChange::Remove(group)));
                }
            } else if before != after {
                if let Some(group) = before {
                    changes.push((owner, MembershipChange::Remove(group)));
                }
                if let Some(group) = after {
                    changes.push((owner, MembershipChange::Add(group)));
                }
            }
        }
        *delta.data_mut() = kept;
    }
    changes
}

/// Data columns a collaborator may set through [`ContactSaver::create_raw_contact`].
fn is_allowed_data_column(column: &str) -> bool {
    column == data_cols::MIMETYPE
        || column == columns::IS_PRIMARY
        || column == columns::IS_SUPER_PRIMARY
        || columns::is_data_column(column)
}

/// Handles every save-core request against one provider and the cards
/// attached to it.
pub struct ContactSaver<S: ContactStore> {
    store: S,
    cards: BTreeMap<CardId, Box<dyn CardStore + Send>>,
    photos: Option<Box<dyn PhotoSink>>,
    config: SaveConfig,
}

impl<S: ContactStore> ContactSaver<S> {
    pub fn new(store: S, config: SaveConfig) -> Self {
        Self {
            store,
            cards: BTreeMap::new(),
            photos: None,
            config,
        }
    }

    pub fn with_card(mut self, card_id: CardId, card: impl CardStore + Send + 'static) -> Self {
        self.cards.insert(card_id, Box::new(card));
        self
    }

    pub fn with_photo_sink(mut self, sink: impl PhotoSink + 'static) -> Self {
        self.photos = Some(Box::new(sink));
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn card(&self, card_id: CardId) -> Option<&(dyn CardStore + Send)> {
        self.cards.get(&card_id).map(|card| card.as_ref())
    }

    pub fn config(&self) -> &SaveConfig {
        &self.config
    }

    fn card_mut(&mut self, card_id: CardId) -> Result<&mut (dyn CardStore + Send), EngineError> {
        match self.cards.get_mut(&card_id) {
            Some(card) => Ok(card.as_mut()),
            None => Err(EngineError::InvalidRequest(format!(
                "no card attached for {}",
                card_id.account_name()
            ))),
        }
    }

    pub fn handle(&mut self, request: Request) -> Result<Response, EngineError> {
        match request {
            Request::Save(request) => self.save(request).map(Response::Saved),
            Request::CreateRawContact { account, rows } => {
                self.create_raw_contact(&account, rows).map(Response::RawContactCreated)
            }
            Request::CreateGroup { account, label, members } => {
                self.create_group(&account, &label, &members).map(Response::GroupCreated)
            }
            Request::RenameGroup { group, label } => self.rename_group(group, &label).map(|_| Response::Done),
            Request::UpdateGroup {
                group,
                label,
                add,
                remove,
            } => self
                .update_group(group, label.as_deref(), &add, &remove)
                .map(|_| Response::Done),
            Request::DeleteGroup(group) => self.delete_group(group).map(|_| Response::Done),
            Request::DeleteContact(contact) => self.delete_contact(contact).map(|_| Response::Deleted(1)),
            Request::DeleteAllForAccount(account) => self.delete_all_for_account(&account).map(Response::Deleted),
            Request::ImportCard(card_id) => self.import_card(card_id).map(Response::Imported),
            Request::Join {
                contact_id1,
                contact_id2,
                writable,
            } => self.join(contact_id1, contact_id2, writable).map(Response::Joined),
            Request::SetStarred { contact, starred } => self.set_starred(contact, starred).map(|_| Response::Done),
            Request::SetSendToVoicemail { contact, enabled } => {
                self.set_send_to_voicemail(contact, enabled).map(|_| Response::Done)
            }
            Request::SetRingtone { contact, ringtone } => {
                self.set_ringtone(contact, ringtone.as_deref()).map(|_| Response::Done)
            }
            Request::SetSuperPrimary(data_id) => self.set_super_primary(data_id).map(|_| Response::Done),
            Request::ClearPrimary(data_id) => self.clear_primary(data_id).map(|_| Response::Done),
        }
    }

    // ========================================================================
    // Save
    // ========================================================================

    pub fn save(&mut self, request: SaveRequest) -> Result<SaveResult, EngineError> {
        let SaveRequest {
            mut model,
            is_profile,
            updated_photos,
        } = request;
        model.trim_empty();
        model.normalize_super_primary();

        let card_id = model.raw_contacts().first().and_then(|delta| delta.account().card_id());
        let (raw_contact_id, inserted) = match card_id {
            Some(card_id) => self.save_card_contact(card_id, model)?,
            None => self.save_local(model)?,
        };

        let contact = if is_profile {
            self.store.profile_contact()?
        } else {
            self.store.contact_ref_for_raw_contact(raw_contact_id)?
        };

        let mut succeeded = true;
        for (key, photo) in &updated_photos {
            let target = if *key < 0 {
                inserted.ok_or_else(|| {
                    EngineError::InconsistentState("could not determine raw contact id for photo".into())
                })?
            } else {
                RawContactId::new(*key)
            };
            if let Err(e) = self.save_photo(target, photo) {
                warn!(raw_contact_id = %target, error = %e, "photo not saved");
                succeeded = false;
            }
        }

        info!(raw_contact_id = %raw_contact_id, inserted = inserted.is_some(), succeeded, "contact saved");
        Ok(SaveResult {
            succeeded,
            contact,
            inserted_raw_contact_id: inserted,
        })
    }

    fn save_photo(&mut self, raw_contact_id: RawContactId, photo: &str) -> Result<(), EngineError> {
        let sink = self
            .photos
            .as_mut()
            .ok_or_else(|| EngineError::Photo("no photo sink configured".into()))?;
        sink.save_photo(raw_contact_id, photo).map_err(EngineError::Photo)
    }

    fn save_local(&mut self, mut model: FieldDeltaModel) -> Result<(RawContactId, Option<RawContactId>), EngineError> {
        let memberships = take_group_memberships(&mut model);
        let options = DiffOptions {
            restore_mode: self.config.restore_mode_for_local,
        };
        let persisted = persist_with_retry(&mut self.store, model, self.config.persist_tries, &options)?;
        let inserted = persisted.inserted_raw_contact_id;
        let raw_contact_id = persisted
            .model
            .find_raw_contact_id()
            .or(inserted)
            .ok_or_else(|| EngineError::InconsistentState("could not determine raw contact id after save".into()))?;

        for (owner, change) in memberships {
            let Some(owner) = owner.or(inserted) else {
                continue;
            };
            match change {
                MembershipChange::Add(group) => {
                    groups::add_members(&mut self.store, &[owner], group)?;
                }
                MembershipChange::Remove(group) => {
                    groups::remove_members(&mut self.store, &[owner], group)?;
                }
            }
        }
        Ok((raw_contact_id, inserted))
    }

    fn save_card_contact(
        &mut self,
        card_id: CardId,
        model: FieldDeltaModel,
    ) -> Result<(RawContactId, Option<RawContactId>), EngineError> {
        if model.len() > 1 {
            return Err(EngineError::InvalidRequest(
                "a card contact has exactly one raw contact".into(),
            ));
        }
        let Some(delta) = model.raw_contacts().first() else {
            return Err(EngineError::InvalidRequest("empty card save".into()));
        };

        if delta.is_delete() {
            let Some(id) = delta.raw_contact_id() else {
                return Err(EngineError::InvalidRequest("delete of an unsaved card contact".into()));
            };
            let card = match self.cards.get_mut(&card_id) {
                Some(card) => card.as_mut(),
                None => return Err(EngineError::InvalidRequest(format!("no card attached for {}", card_id.account_name()))),
            };
            card_sync::delete_from_card(&self.store, card, id)?;
            let options = DiffOptions::default();
            persist_with_retry(&mut self.store, model, self.config.persist_tries, &options)?;
            return Ok((id, None));
        }

        let card = match self.cards.get_mut(&card_id) {
            Some(card) => card.as_mut(),
            None => return Err(EngineError::InvalidRequest(format!("no card attached for {}", card_id.account_name()))),
        };
        let outcome = CardSync::new(&mut self.store, card, &self.config).run(delta)?;
        Ok((
            outcome.raw_contact_id,
            outcome.inserted.then_some(outcome.raw_contact_id),
        ))
    }

    /// Inserts a raw contact with the given data rows in one batch. Each row
    /// carries its `mimetype`; columns outside the data payload are ignored.
    pub fn create_raw_contact(
        &mut self,
        account: &Account,
        rows: Vec<DataValues>,
    ) -> Result<Option<ContactRef>, EngineError> {
        let mut ops = vec![ProviderOp::insert(Target::RawContacts)
            .value(rc::ACCOUNT_TYPE, account.account_type.as_str())
            .value(rc::ACCOUNT_NAME, account.account_name.as_str())
            .build()];
        for row in rows {
            if !row.contains_key(data_cols::MIMETYPE) {
                return Err(EngineError::InvalidRequest("data row without mimetype".into()));
            }
            let values: DataValues = row
                .into_iter()
                .filter(|(column, _)| is_allowed_data_column(column))
                .collect();
            ops.push(
                ProviderOp::insert(Target::Data)
                    .back_reference(data_cols::RAW_CONTACT_ID, 0)
                    .values(values)
                    .build(),
            );
        }
        let results = apply(&mut self.store, &ops)?;
        let Some(id) = applier::inserted_raw_contact_id(&ops, &results) else {
            return Err(EngineError::InconsistentState("raw contact insert returned no id".into()));
        };
        debug!(raw_contact_id = %id, rows = ops.len() - 1, "raw contact created");
        Ok(self.store.contact_ref_for_raw_contact(id)?)
    }

    // ========================================================================
    // Groups
    // ========================================================================

    fn card_group_tag(&self, group: GroupId) -> Result<(contactsave_storage::GroupRecord, Option<(CardId, String)>), EngineError> {
        let record = self
            .store
            .group(group)?
            .ok_or_else(|| EngineError::NotFound(format!("group {group}")))?;
        let card = match (record.account.card_id(), record.source_id.clone()) {
            (Some(card_id), Some(tag)) => Some((card_id, tag)),
            _ => None,
        };
        Ok((record, card))
    }

    pub fn create_group(
        &mut self,
        account: &Account,
        label: &str,
        members: &[RawContactId],
    ) -> Result<GroupId, EngineError> {
        let tag = match account.card_id() {
            Some(card_id) => {
                let label = label.to_string();
                Some(on_card_thread(self.card_mut(card_id)?, move |card| card.insert_group(&label))?)
            }
            None => None,
        };

        let mut insert = ProviderOp::insert(Target::Groups)
            .value(group_cols::ACCOUNT_TYPE, account.account_type.as_str())
            .value(group_cols::ACCOUNT_NAME, account.account_name.as_str())
            .value(group_cols::TITLE, label);
        if let Some(tag) = &tag {
            insert = insert.value(group_cols::SOURCE_ID, tag.as_str());
        }
        let ops = [insert.build()];
        let results = apply(&mut self.store, &ops)?;
        let group = results
            .first()
            .and_then(|r| r.inserted_id)
            .map(GroupId::new)
            .ok_or_else(|| EngineError::InconsistentState("group insert returned no id".into()))?;

        if let (Some(card_id), Some(tag)) = (account.card_id(), tag) {
            let slots = groups::card_slots(&self.store, members)?;
            on_card_thread(self.card_mut(card_id)?, move |card| card.add_group_members(&tag, &slots))?;
        }
        groups::add_members(&mut self.store, members, group)?;
        info!(group = %group, members = members.len(), "group created");
        Ok(group)
    }

    pub fn rename_group(&mut self, group: GroupId, label: &str) -> Result<(), EngineError> {
        let (_, card) = self.card_group_tag(group)?;
        if let Some((card_id, tag)) = card {
            let label = label.to_string();
            on_card_thread(self.card_mut(card_id)?, move |card| card.rename_group(&tag, &label))?;
        }
        self.set_group_title(group, label)
    }

    fn set_group_title(&mut self, group: GroupId, label: &str) -> Result<(), EngineError> {
        apply(
            &mut self.store,
            &[ProviderOp::update(Target::Groups)
                .with_selection(group_cols::ID, group.get())
                .value(group_cols::TITLE, label)
                .build()],
        )?;
        Ok(())
    }

    pub fn update_group(
        &mut self,
        group: GroupId,
        label: Option<&str>,
        add: &[RawContactId],
        remove: &[RawContactId],
    ) -> Result<(), EngineError> {
        let (record, card) = self.card_group_tag(group)?;
        let relabel = label.filter(|label| record.title.as_deref() != Some(*label));

        if let Some((card_id, tag)) = card {
            let add_slots = groups::card_slots(&self.store, add)?;
            let remove_slots = groups::card_slots(&self.store, remove)?;
            let label = relabel.map(str::to_string);
            on_card_thread(self.card_mut(card_id)?, move |card| {
                if let Some(label) = &label {
                    card.rename_group(&tag, label)?;
                }
                card.remove_group_members(&tag, &remove_slots)?;
                card.add_group_members(&tag, &add_slots)
            })?;
        }

        if let Some(label) = label {
            self.set_group_title(group, label)?;
        }
        groups::add_members(&mut self.store, add, group)?;
        groups::remove_members(&mut self.store, remove, group)?;
        debug!(group = %group, added = add.len(), removed = remove.len(), "group updated");
        Ok(())
    }

    pub fn delete_group(&mut self, group: GroupId) -> Result<(), EngineError> {
        let (_, card) = self.card_group_tag(group)?;
        if let Some((card_id, tag)) = card {
            let members = self.store.raw_contacts_in_group(group)?;
            let slots = groups::card_slots(&self.store, &members)?;
            {
                let tag = tag.clone();
                on_card_thread(self.card_mut(card_id)?, move |card| card.remove_group_members(&tag, &slots))?;
            }
            groups::remove_members(&mut self.store, &members, group)?;
            on_card_thread(self.card_mut(card_id)?, move |card| card.remove_group(&tag))?;
        }
        apply(
            &mut self.store,
            &[ProviderOp::delete(Target::Groups)
                .with_selection(group_cols::ID, group.get())
                .build()],
        )?;
        info!(group = %group, "group deleted");
        Ok(())
    }

    // ========================================================================
    // Deletes and card import
    // ========================================================================

    /// Deletes a contact and every raw contact behind it. Card-backed raw
    /// contacts lose their card record and group memberships first.
    pub fn delete_contact(&mut self, contact: ContactId) -> Result<(), EngineError> {
        for info in self.store.raw_contacts_for_contact(contact)? {
            let Some(card_id) = info.account.card_id() else {
                continue;
            };
            let card = match self.cards.get_mut(&card_id) {
                Some(card) => card.as_mut(),
                None => return Err(EngineError::InvalidRequest(format!("no card attached for {}", card_id.account_name()))),
            };
            card_sync::delete_from_card(&self.store, card, info.id)?;
            for group in self.store.group_ids_for_raw_contact(info.id)? {
                groups::remove_members(&mut self.store, &[info.id], group)?;
            }
        }
        let results = apply(
            &mut self.store,
            &[ProviderOp::delete(Target::Contacts)
                .with_selection(contact_cols::ID, contact.get())
                .build()],
        )?;
        if results.first().is_none_or(|r| r.count == 0) {
            return Err(EngineError::NotFound(format!("contact {contact}")));
        }
        info!(contact = %contact, "contact deleted");
        Ok(())
    }

    /// Returns how many contacts were deleted.
    pub fn delete_all_for_account(&mut self, account: &Account) -> Result<usize, EngineError> {
        let mut contacts: Vec<ContactId> = self
            .store
            .raw_contacts_for_account(account)?
            .into_iter()
            .filter_map(|info| info.contact_id)
            .collect();
        contacts.sort();
        contacts.dedup();
        for contact in &contacts {
            self.delete_contact(*contact)?;
        }
        info!(account = %account.account_name, deleted = contacts.len(), "account contacts deleted");
        Ok(contacts.len())
    }

    pub fn import_card(&mut self, card_id: CardId) -> Result<usize, EngineError> {
        let card = self
            .cards
            .get(&card_id)
            .ok_or_else(|| EngineError::InvalidRequest(format!("no card attached for {}", card_id.account_name())))?;
        card_sync::import_card(&mut self.store, card.as_ref(), &Account::card(card_id), &self.config)
    }

    // ========================================================================
    // Join and contact flags
    // ========================================================================

    pub fn join(
        &mut self,
        contact_id1: ContactId,
        contact_id2: ContactId,
        writable: bool,
    ) -> Result<ContactRef, EngineError> {
        join::join_contacts(&mut self.store, contact_id1, contact_id2, writable)
    }

    fn update_contact(&mut self, contact: ContactId, column: &str, value: FieldValue) -> Result<(), EngineError> {
        let results = apply(
            &mut self.store,
            &[ProviderOp::update(Target::Contacts)
                .with_selection(contact_cols::ID, contact.get())
                .value(column, value)
                .build()],
        )?;
        if results.first().is_none_or(|r| r.count == 0) {
            return Err(EngineError::NotFound(format!("contact {contact}")));
        }
        Ok(())
    }

    pub fn set_starred(&mut self, contact: ContactId, starred: bool) -> Result<(), EngineError> {
        self.update_contact(contact, contact_cols::STARRED, starred.into())
    }

    pub fn set_send_to_voicemail(&mut self, contact: ContactId, enabled: bool) -> Result<(), EngineError> {
        self.update_contact(contact, contact_cols::SEND_TO_VOICEMAIL, enabled.into())
    }

    pub fn set_ringtone(&mut self, contact: ContactId, ringtone: Option<&str>) -> Result<(), EngineError> {
        let value = ringtone.map_or(FieldValue::Null, FieldValue::from);
        self.update_contact(contact, contact_cols::CUSTOM_RINGTONE, value)
    }

    fn update_primary(&mut self, data_id: contactsave_core::DataId, primary: bool) -> Result<(), EngineError> {
        let results = apply(
            &mut self.store,
            &[ProviderOp::update(Target::Data)
                .with_selection(data_cols::ID, data_id.get())
                .value(columns::IS_PRIMARY, primary)
                .value(columns::IS_SUPER_PRIMARY, primary)
                .build()],
        )?;
        if results.first().is_none_or(|r| r.count == 0) {
            return Err(EngineError::NotFound(format!("data row {data_id}")));
        }
        Ok(())
    }

    pub fn set_super_primary(&mut self, data_id: contactsave_core::DataId) -> Result<(), EngineError> {
        self.update_primary(data_id, true)
    }

    pub fn clear_primary(&mut self, data_id: contactsave_core::DataId) -> Result<(), EngineError> {
        self.update_primary(data_id, false)
    }
}

impl<S: ContactStore> std::fmt::Debug for ContactSaver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContactSaver")
            .field("cards", &self.cards.keys().collect::<Vec<_>>())
            .field("photo_sink", &self.photos.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
