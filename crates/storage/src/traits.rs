use contactsave_core::{
    Account, AggregationMode, CardSlot, ContactId, ContactRef, GroupId, RawContactId,
    RawContactSnapshot,
};

use crate::error::StorageError;
use crate::ops::{OpResult, ProviderOp, Selection, Target};

/// Raw contact attributes used for joins, deletes and imports, without data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContactInfo {
    pub id: RawContactId,
    pub contact_id: Option<ContactId>,
    pub account: Account,
    pub version: i64,
    pub aggregation_mode: AggregationMode,
    pub name_verified: bool,
    pub display_name_source: i64,
    pub card_slot: Option<CardSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactRecord {
    pub id: ContactId,
    pub lookup_key: String,
    pub name_raw_contact_id: Option<RawContactId>,
    pub display_name: Option<String>,
    pub starred: bool,
    pub send_to_voicemail: bool,
    pub custom_ringtone: Option<String>,
}

impl ContactRecord {
    pub fn contact_ref(&self) -> ContactRef {
        ContactRef {
            contact_id: self.id,
            lookup_key: self.lookup_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub account: Account,
    pub title: Option<String>,
    /// Card-side group tag for groups mirrored on a card.
    pub source_id: Option<String>,
}

/// The relational contact provider.
pub trait ContactStore {
    /// Applies every op or none of them. Results are in op order.
    fn apply_batch(&mut self, ops: &[ProviderOp]) -> Result<Vec<OpResult>, StorageError>;

    /// Current snapshots of the requested raw contacts. Ids that no longer
    /// exist are skipped.
    fn load_raw_contacts(&self, ids: &[RawContactId]) -> Result<Vec<RawContactSnapshot>, StorageError>;

    fn raw_contact(&self, id: RawContactId) -> Result<Option<RawContactSnapshot>, StorageError> {
        Ok(self.load_raw_contacts(&[id])?.into_iter().next())
    }

    fn raw_contact_info(&self, id: RawContactId) -> Result<Option<RawContactInfo>, StorageError>;

    fn contact(&self, id: ContactId) -> Result<Option<ContactRecord>, StorageError>;

    fn contact_by_lookup_key(&self, lookup_key: &str) -> Result<Option<ContactRecord>, StorageError>;

    fn contact_ref_for_raw_contact(&self, id: RawContactId) -> Result<Option<ContactRef>, StorageError> {
        let Some(info) = self.raw_contact_info(id)? else {
            return Ok(None);
        };
        let Some(contact_id) = info.contact_id else {
            return Ok(None);
        };
        Ok(self.contact(contact_id)?.map(|c| c.contact_ref()))
    }

    fn raw_contacts_for_contact(&self, id: ContactId) -> Result<Vec<RawContactInfo>, StorageError>;

    fn raw_contacts_for_account(&self, account: &Account) -> Result<Vec<RawContactInfo>, StorageError>;

    fn raw_contact_for_card_slot(
        &self,
        account: &Account,
        slot: CardSlot,
    ) -> Result<Option<RawContactId>, StorageError>;

    fn profile_contact(&self) -> Result<Option<ContactRef>, StorageError>;

    fn group(&self, id: GroupId) -> Result<Option<GroupRecord>, StorageError>;

    fn groups_for_account(&self, account: &Account) -> Result<Vec<GroupRecord>, StorageError>;

    fn group_ids_for_raw_contact(&self, id: RawContactId) -> Result<Vec<GroupId>, StorageError>;

    fn raw_contacts_in_group(&self, id: GroupId) -> Result<Vec<RawContactId>, StorageError>;

    fn count(&self, target: Target, selection: &Selection) -> Result<u64, StorageError>;
}
