//! Card Synchronization Engine.
//!
//! A card-account save writes the card first, then mirrors the card's
//! view of the record onto the provider raw contact:
//!
//! ```text
//! Idle -> ProviderDisabled -> CardWrite -> ProviderWrite -> ProviderEnabled
//!   \____ (insert) ________/      any step may end in Failed
//! ```
//!
//! The provider mirror batch opens with the aggregation suspend and closes
//! with the restore to `Disabled`, so a failure before `ProviderWrite`
//! leaves the raw contact untouched. A card write that succeeded is not
//! rolled back when the mirror fails.

use std::thread;

use tracing::{debug, info, warn};

use contactsave_core::{
    Account, AggregationMode, CardSlot, DataDelta, DataKind, DataRow, EmailType, FieldDeltaModel, GroupId,
    PhoneType, RawContactDelta, RawContactId, RawContactSnapshot, columns,
};
use contactsave_storage::{CardEntry, CardError, CardStore, CardWrite, ContactStore};
use contactsave_storage::card::NUMBER_SEPARATORS;

use crate::applier::persist_with_retry;
use crate::config::SaveConfig;
use crate::diff::DiffOptions;
use crate::error::EngineError;
use crate::groups;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardSyncState {
    Idle,
    ProviderDisabled,
    CardWrite,
    ProviderWrite,
    ProviderEnabled,
    Failed,
}

pub fn strip_separators(number: &str) -> String {
    number.chars().filter(|c| !NUMBER_SEPARATORS.contains(c)).collect()
}

/// Splits a raw contact's phones into the card's primary number and
/// additional number (ANR). Only mobile and home numbers reach the card;
/// a deleted phone contributes an empty value.
pub fn bucket_numbers(delta: &RawContactDelta, strip: bool) -> (String, String) {
    let mut primary = String::new();
    let mut anr = String::new();
    for entry in delta.entries(&DataKind::Phone) {
        let Some(row) = entry.after().or(entry.before()) else {
            continue;
        };
        let (Some(phone_type), Some(number)) = (row.phone_type(), row.text(columns::NUMBER)) else {
            continue;
        };
        if number.is_empty() {
            continue;
        }
        let number = if entry.is_delete() {
            String::new()
        } else if strip {
            strip_separators(number)
        } else {
            number.to_string()
        };
        match phone_type {
            PhoneType::Mobile => {
                if primary.is_empty() {
                    primary = number;
                } else {
                    anr = number;
                }
            }
            PhoneType::Home => {
                if anr.is_empty() {
                    anr = number;
                } else if primary.is_empty() {
                    primary = number;
                } else {
                    anr = number;
                }
            }
            _ => {}
        }
    }
    (primary, anr)
}

fn card_name(delta: &RawContactDelta) -> String {
    delta
        .primary_entry(&DataKind::StructuredName)
        .and_then(|entry| entry.after())
        .and_then(|row| row.text(columns::DISPLAY_NAME))
        .unwrap_or_default()
        .to_string()
}

fn card_email(delta: &RawContactDelta) -> String {
    let Some(entry) = delta.entries(&DataKind::Email).next() else {
        return String::new();
    };
    if entry.is_delete() {
        return String::new();
    }
    entry
        .after()
        .and_then(|row| row.text(columns::ADDRESS))
        .unwrap_or_default()
        .to_string()
}

/// What a card save writes, plus the membership changes that follow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardPlan {
    pub write: CardWrite,
    pub groups_to_add: Vec<GroupId>,
    pub groups_to_remove: Vec<GroupId>,
}

pub fn plan_card_write<S: ContactStore + ?Sized>(
    store: &S,
    delta: &RawContactDelta,
    config: &SaveConfig,
) -> Result<CardPlan, EngineError> {
    let (number, anr) = bucket_numbers(delta, config.strip_number_separators);
    let current = match delta.raw_contact_id() {
        Some(id) => store.group_ids_for_raw_contact(id)?,
        None => Vec::new(),
    };

    let mut groups_to_add = Vec::new();
    let mut groups_to_remove = Vec::new();
    let mut kept = Vec::new();
    for entry in delta.entries(&DataKind::GroupMembership) {
        let Some(group) = entry.after().or(entry.before()).and_then(DataRow::group_id) else {
            continue;
        };
        if entry.is_delete() {
            groups_to_remove.push(group);
            continue;
        }
        if !current.contains(&group) {
            groups_to_add.push(group);
        }
        kept.push(group);
    }

    Ok(CardPlan {
        write: CardWrite {
            name: Some(card_name(delta)),
            number: Some(number),
            anr: Some(anr),
            email: Some(card_email(delta)),
            group_tags: Some(groups::card_tags_for(store, &kept)?),
        },
        groups_to_add,
        groups_to_remove,
    })
}

fn first_row<'a>(
    snapshot: &'a RawContactSnapshot,
    kind: &DataKind,
    phone_type: Option<PhoneType>,
) -> Option<&'a DataRow> {
    snapshot
        .rows(kind)
        .find(|row| phone_type.is_none() || row.phone_type() == phone_type)
}

fn first_text(snapshot: &RawContactSnapshot, kind: &DataKind, phone_type: Option<PhoneType>, column: &str) -> String {
    first_row(snapshot, kind, phone_type)
        .and_then(|row| row.text(column))
        .unwrap_or_default()
        .to_string()
}

/// The card record as the provider mirror currently describes it.
pub fn mirrored_entry<S: ContactStore + ?Sized>(
    store: &S,
    snapshot: &RawContactSnapshot,
) -> Result<CardEntry, EngineError> {
    let group_ids = match snapshot.id() {
        Some(id) => store.group_ids_for_raw_contact(id)?,
        None => Vec::new(),
    };
    Ok(CardEntry {
        name: first_text(snapshot, &DataKind::StructuredName, None, columns::DISPLAY_NAME),
        number: first_text(snapshot, &DataKind::Phone, Some(PhoneType::Mobile), columns::NUMBER),
        anr: first_text(snapshot, &DataKind::Phone, Some(PhoneType::Home), columns::NUMBER),
        email: first_text(snapshot, &DataKind::Email, None, columns::ADDRESS),
        group_tags: groups::card_tags_for(store, &group_ids)?,
    })
}

/// Insert model for a record that exists only on the card.
pub fn mirror_insert(account: Account, slot: CardSlot, entry: &CardEntry) -> FieldDeltaModel {
    let mut delta = RawContactDelta::insert(account);
    if let Some(state) = delta.after_mut() {
        state.aggregation_mode = AggregationMode::Disabled;
        state.card_slot = Some(slot);
    }
    if !entry.name.is_empty() {
        delta.add(DataDelta::insert(DataRow::name(&entry.name)));
    }
    if !entry.number.is_empty() {
        delta.add(DataDelta::insert(DataRow::phone(&entry.number, PhoneType::Mobile).primary()));
    }
    if !entry.email.is_empty() {
        delta.add(DataDelta::insert(DataRow::email(&entry.email, EmailType::Mobile)));
    }
    if !entry.anr.is_empty() {
        delta.add(DataDelta::insert(DataRow::phone(&entry.anr, PhoneType::Home)));
    }
    FieldDeltaModel::single(delta)
}

enum Mirrored {
    Name,
    Number,
    Anr,
    Email,
}

impl Mirrored {
    fn kind(&self) -> DataKind {
        match self {
            Self::Name => DataKind::StructuredName,
            Self::Number | Self::Anr => DataKind::Phone,
            Self::Email => DataKind::Email,
        }
    }

    fn column(&self) -> &'static str {
        match self {
            Self::Name => columns::DISPLAY_NAME,
            Self::Number | Self::Anr => columns::NUMBER,
            Self::Email => columns::ADDRESS,
        }
    }

    fn matches(&self, row: &DataRow) -> bool {
        match self {
            Self::Number => row.phone_type() == Some(PhoneType::Mobile),
            Self::Anr => row.phone_type() == Some(PhoneType::Home),
            _ => true,
        }
    }

    fn new_row(&self, value: &str) -> DataRow {
        match self {
            Self::Name => DataRow::name(value),
            Self::Number => DataRow::phone(value, PhoneType::Mobile).primary(),
            Self::Anr => DataRow::phone(value, PhoneType::Home),
            Self::Email => DataRow::email(value, EmailType::Mobile),
        }
    }
}

fn mirror_field(delta: &mut RawContactDelta, field: Mirrored, value: &str) {
    let kind = field.kind();
    let existing = delta.data_mut().iter_mut().find(|entry| {
        entry.kind() == &kind && !entry.is_delete() && entry.after().is_some_and(|row| field.matches(row))
    });
    match existing {
        None => {
            if !value.is_empty() {
                delta.add(DataDelta::insert(field.new_row(value)));
            }
        }
        Some(entry) => {
            let old = entry.after().and_then(|row| row.text(field.column())).unwrap_or_default();
            if old == value {
                return;
            }
            if value.is_empty() {
                entry.mark_deleted();
                return;
            }
            entry.set(field.column(), value);
            if matches!(field, Mirrored::Name) {
                for column in [
                    columns::GIVEN_NAME,
                    columns::FAMILY_NAME,
                    columns::PREFIX,
                    columns::MIDDLE_NAME,
                    columns::SUFFIX,
                ] {
                    entry.set(column, "");
                }
            }
        }
    }
}

/// Update model that brings an existing mirror in line with `entry`.
pub fn mirror_update(snapshot: RawContactSnapshot, slot: CardSlot, entry: &CardEntry) -> FieldDeltaModel {
    let mut delta = RawContactDelta::from_snapshot(snapshot);
    if let Some(state) = delta.after_mut() {
        state.card_slot = Some(slot);
    }
    mirror_field(&mut delta, Mirrored::Name, &entry.name);
    mirror_field(&mut delta, Mirrored::Number, &entry.number);
    mirror_field(&mut delta, Mirrored::Email, &entry.email);
    mirror_field(&mut delta, Mirrored::Anr, &entry.anr);
    FieldDeltaModel::single(delta)
}

/// Runs a card operation on a worker thread and waits for it.
pub fn on_card_thread<T, F>(card: &mut (dyn CardStore + Send), op: F) -> Result<T, EngineError>
where
    T: Send,
    F: FnOnce(&mut (dyn CardStore + Send)) -> Result<T, CardError> + Send,
{
    thread::scope(|scope| scope.spawn(move || op(card)).join())
        .map_err(|_| EngineError::InconsistentState("card worker panicked".into()))?
        .map_err(EngineError::from)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardSyncOutcome {
    pub raw_contact_id: RawContactId,
    pub slot: CardSlot,
    pub inserted: bool,
}

pub struct CardSync<'a, S: ContactStore + ?Sized> {
    store: &'a mut S,
    card: &'a mut (dyn CardStore + Send),
    config: &'a SaveConfig,
    state: CardSyncState,
}

impl<'a, S: ContactStore + ?Sized> CardSync<'a, S> {
    pub fn new(store: &'a mut S, card: &'a mut (dyn CardStore + Send), config: &'a SaveConfig) -> Self {
        Self {
            store,
            card,
            config,
            state: CardSyncState::Idle,
        }
    }

    pub fn state(&self) -> CardSyncState {
        self.state
    }

    fn transition(&mut self, next: CardSyncState) {
        debug!(from = ?self.state, to = ?next, "card sync");
        self.state = next;
    }

    /// Saves one card-account raw contact. Group memberships are reconciled
    /// on the provider after the mirror commits.
    pub fn run(&mut self, delta: &RawContactDelta) -> Result<CardSyncOutcome, EngineError> {
        match self.sync(delta) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(state = ?self.state, error = %e, "card sync failed");
                self.transition(CardSyncState::Failed);
                Err(e)
            }
        }
    }

    fn sync(&mut self, delta: &RawContactDelta) -> Result<CardSyncOutcome, EngineError> {
        let account = delta.account().clone();
        let plan = plan_card_write(&*self.store, delta, self.config)?;
        let entry = plan.write.to_entry();
        let options = DiffOptions {
            restore_mode: AggregationMode::Disabled,
        };

        let (raw_contact_id, slot, inserted) = match delta.raw_contact_id() {
            None => {
                self.transition(CardSyncState::CardWrite);
                let write = plan.write.clone();
                let slot = on_card_thread(self.card, move |card| card.insert(&write))?;

                self.transition(CardSyncState::ProviderWrite);
                let model = mirror_insert(account, slot, &entry);
                let persisted = persist_with_retry(self.store, model, self.config.persist_tries, &options)?;
                let id = persisted.inserted_raw_contact_id.ok_or_else(|| {
                    EngineError::InconsistentState("card mirror insert produced no raw contact".into())
                })?;
                (id, slot, true)
            }
            Some(id) => {
                self.transition(CardSyncState::ProviderDisabled);
                let snapshot = self
                    .store
                    .raw_contact(id)?
                    .ok_or_else(|| EngineError::NotFound(format!("raw contact {id}")))?;
                let previous = mirrored_entry(&*self.store, &snapshot)?;
                let hint = snapshot.state.card_slot;

                self.transition(CardSyncState::CardWrite);
                let write = plan.write.clone();
                let slot = on_card_thread(self.card, move |card| card.update(hint, &previous, &write))?;

                self.transition(CardSyncState::ProviderWrite);
                let model = mirror_update(snapshot, slot, &entry);
                persist_with_retry(self.store, model, self.config.persist_tries, &options)?;
                (id, slot, false)
            }
        };
        self.transition(CardSyncState::ProviderEnabled);

        for group in &plan.groups_to_add {
            groups::add_members(self.store, &[raw_contact_id], *group)?;
        }
        for group in &plan.groups_to_remove {
            groups::remove_members(self.store, &[raw_contact_id], *group)?;
        }
        info!(raw_contact_id = %raw_contact_id, slot = %slot, inserted, "card contact saved");
        Ok(CardSyncOutcome {
            raw_contact_id,
            slot,
            inserted,
        })
    }
}

/// Removes a card-backed raw contact's record from its card.
pub fn delete_from_card<S: ContactStore + ?Sized>(
    store: &S,
    card: &mut (dyn CardStore + Send),
    raw_contact_id: RawContactId,
) -> Result<(), EngineError> {
    let Some(snapshot) = store.raw_contact(raw_contact_id)? else {
        return Err(EngineError::NotFound(format!("raw contact {raw_contact_id}")));
    };
    let previous = mirrored_entry(store, &snapshot)?;
    let hint = snapshot.state.card_slot;
    match on_card_thread(card, move |card| card.delete(hint, &previous)) {
        Ok(()) | Err(EngineError::CardWrite(CardError::NotFound(_))) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Mirrors every card record that has no provider raw contact yet and
/// restores its group memberships from the card's tags. Returns how many
/// records were imported.
pub fn import_card<S: ContactStore + ?Sized>(
    store: &mut S,
    card: &(dyn CardStore + Send),
    account: &Account,
    config: &SaveConfig,
) -> Result<usize, EngineError> {
    let options = DiffOptions {
        restore_mode: AggregationMode::Disabled,
    };
    let groups = store.groups_for_account(account)?;
    let mut imported = 0;
    for record in card.records()? {
        if store.raw_contact_for_card_slot(account, record.slot)?.is_some() {
            continue;
        }
        let model = mirror_insert(account.clone(), record.slot, &record.entry);
        let persisted = persist_with_retry(store, model, config.persist_tries, &options)?;
        let Some(id) = persisted.inserted_raw_contact_id else {
            continue;
        };
        for tag in record.entry.tags() {
            if let Some(group) = groups.iter().find(|g| g.source_id.as_deref() == Some(tag)) {
                groups::add_members(store, &[id], group.id)?;
            }
        }
        imported += 1;
    }
    info!(account = %account.account_name, imported, "card imported");
    Ok(imported)
}
