use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use contactsave_core::{
    Account, CardSlot, ContactId, ContactRef, GroupId, RawContactId, RawContactSnapshot,
};
use contactsave_storage::{
    CardEntry, CardError, CardLimits, CardRecord, CardStore, CardWrite, ContactRecord, ContactStore,
    GroupRecord, MemoryCard, OpResult, ProviderOp, RawContactInfo, Selection, SqliteProvider, StorageError,
    Target,
};

/// What happens to the next batch a [`FaultyStore`] receives.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Another writer commits these ops just before the batch runs.
    ConcurrentWrite(Vec<ProviderOp>),
    /// The batch fails its first assertion.
    Conflict,
    /// The provider cannot be reached.
    Unavailable,
}

/// Provider wrapper that injects queued faults, one per batch.
pub struct FaultyStore {
    inner: SqliteProvider,
    faults: VecDeque<Fault>,
    attempts: usize,
    committed: usize,
}

impl FaultyStore {
    pub fn new(inner: SqliteProvider) -> Self {
        Self {
            inner,
            faults: VecDeque::new(),
            attempts: 0,
            committed: 0,
        }
    }

    pub fn inject(&mut self, fault: Fault) {
        self.faults.push_back(fault);
    }

    pub fn inner(&self) -> &SqliteProvider {
        &self.inner
    }

    /// Batches handed to the store, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn committed(&self) -> usize {
        self.committed
    }

    pub fn reset_counters(&mut self) {
        self.attempts = 0;
        self.committed = 0;
    }
}

impl ContactStore for FaultyStore {
    fn apply_batch(&mut self, ops: &[ProviderOp]) -> Result<Vec<OpResult>, StorageError> {
        self.attempts += 1;
        match self.faults.pop_front() {
            Some(Fault::ConcurrentWrite(concurrent)) => {
                debug!(ops = concurrent.len(), "injecting concurrent write");
                self.inner.apply_batch(&concurrent)?;
            }
            Some(Fault::Conflict) => {
                return Err(StorageError::AssertionFailed {
                    index: 0,
                    reason: "injected conflict".into(),
                });
            }
            Some(Fault::Unavailable) => {
                return Err(StorageError::Unavailable("injected outage".into()));
            }
            None => {}
        }
        let results = self.inner.apply_batch(ops)?;
        self.committed += 1;
        Ok(results)
    }

    fn load_raw_contacts(&self, ids: &[RawContactId]) -> Result<Vec<RawContactSnapshot>, StorageError> {
        self.inner.load_raw_contacts(ids)
    }

    fn raw_contact_info(&self, id: RawContactId) -> Result<Option<RawContactInfo>, StorageError> {
        self.inner.raw_contact_info(id)
    }

    fn contact(&self, id: ContactId) -> Result<Option<ContactRecord>, StorageError> {
        self.inner.contact(id)
    }

    fn contact_by_lookup_key(&self, lookup_key: &str) -> Result<Option<ContactRecord>, StorageError> {
        self.inner.contact_by_lookup_key(lookup_key)
    }

    fn raw_contacts_for_contact(&self, id: ContactId) -> Result<Vec<RawContactInfo>, StorageError> {
        self.inner.raw_contacts_for_contact(id)
    }

    fn raw_contacts_for_account(&self, account: &Account) -> Result<Vec<RawContactInfo>, StorageError> {
        self.inner.raw_contacts_for_account(account)
    }

    fn raw_contact_for_card_slot(
        &self,
        account: &Account,
        slot: CardSlot,
    ) -> Result<Option<RawContactId>, StorageError> {
        self.inner.raw_contact_for_card_slot(account, slot)
    }

    fn profile_contact(&self) -> Result<Option<ContactRef>, StorageError> {
        self.inner.profile_contact()
    }

    fn group(&self, id: GroupId) -> Result<Option<GroupRecord>, StorageError> {
        self.inner.group(id)
    }

    fn groups_for_account(&self, account: &Account) -> Result<Vec<GroupRecord>, StorageError> {
        self.inner.groups_for_account(account)
    }

    fn group_ids_for_raw_contact(&self, id: RawContactId) -> Result<Vec<GroupId>, StorageError> {
        self.inner.group_ids_for_raw_contact(id)
    }

    fn raw_contacts_in_group(&self, id: GroupId) -> Result<Vec<RawContactId>, StorageError> {
        self.inner.raw_contacts_in_group(id)
    }

    fn count(&self, target: Target, selection: &Selection) -> Result<u64, StorageError> {
        self.inner.count(target, selection)
    }
}

/// A [`MemoryCard`] whose record writes fail with queued errors. The queue
/// and the card contents are shared with every clone, so a test can keep a
/// clone to inspect the card after handing one to the saver.
#[derive(Clone, Default)]
pub struct FlakyCard {
    inner: Arc<Mutex<MemoryCard>>,
    failures: Arc<Mutex<VecDeque<CardError>>>,
    limits: CardLimits,
}

impl FlakyCard {
    pub fn new(limits: CardLimits) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryCard::new(limits.clone()))),
            failures: Arc::default(),
            limits,
        }
    }

    pub fn fail_next_write(&self, error: CardError) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(error);
        }
    }

    fn take_failure(&self) -> Result<(), CardError> {
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| CardError::Rejected("failure queue poisoned".into()))?;
        match failures.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_card<T>(&self, f: impl FnOnce(&mut MemoryCard) -> Result<T, CardError>) -> Result<T, CardError> {
        let mut card = self
            .inner
            .lock()
            .map_err(|_| CardError::Rejected("card poisoned".into()))?;
        f(&mut card)
    }

    pub fn group_label(&self, tag: &str) -> Option<String> {
        self.with_card(|card| Ok(card.group_label(tag).map(str::to_string)))
            .ok()
            .flatten()
    }

    pub fn used(&self) -> usize {
        self.with_card(|card| Ok(card.used())).unwrap_or_default()
    }
}

impl CardStore for FlakyCard {
    fn limits(&self) -> &CardLimits {
        &self.limits
    }

    fn insert(&mut self, write: &CardWrite) -> Result<CardSlot, CardError> {
        self.take_failure()?;
        self.with_card(|card| card.insert(write))
    }

    fn update(
        &mut self,
        slot_hint: Option<CardSlot>,
        previous: &CardEntry,
        write: &CardWrite,
    ) -> Result<CardSlot, CardError> {
        self.take_failure()?;
        self.with_card(|card| card.update(slot_hint, previous, write))
    }

    fn delete(&mut self, slot_hint: Option<CardSlot>, previous: &CardEntry) -> Result<(), CardError> {
        self.take_failure()?;
        self.with_card(|card| card.delete(slot_hint, previous))
    }

    fn read(&self, slot: CardSlot) -> Result<Option<CardRecord>, CardError> {
        self.with_card(|card| card.read(slot))
    }

    fn records(&self) -> Result<Vec<CardRecord>, CardError> {
        self.with_card(|card| card.records())
    }

    fn insert_group(&mut self, label: &str) -> Result<String, CardError> {
        self.with_card(|card| card.insert_group(label))
    }

    fn rename_group(&mut self, tag: &str, label: &str) -> Result<(), CardError> {
        self.with_card(|card| card.rename_group(tag, label))
    }

    fn remove_group(&mut self, tag: &str) -> Result<(), CardError> {
        self.with_card(|card| card.remove_group(tag))
    }

    fn add_group_members(&mut self, tag: &str, slots: &[CardSlot]) -> Result<(), CardError> {
        self.with_card(|card| card.add_group_members(tag, slots))
    }

    fn remove_group_members(&mut self, tag: &str, slots: &[CardSlot]) -> Result<(), CardError> {
        self.with_card(|card| card.remove_group_members(tag, slots))
    }
}
