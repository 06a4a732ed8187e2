//! The external card phonebook: fixed-shape records addressed by slot, plus
//! a small group table whose tags records reference.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use contactsave_core::CardSlot;

/// Characters that may appear in a typed number but never on the card.
pub const NUMBER_SEPARATORS: [char; 7] = ['(', ')', '-', '.', '/', ';', ' '];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CardError {
    #[error("card is full")]
    Full,

    #[error("name longer than {max} characters")]
    NameTooLong { max: usize },

    #[error("number longer than {max} characters")]
    NumberTooLong { max: usize },

    #[error("invalid number: {0}")]
    InvalidNumber(String),

    #[error("invalid e-mail: {0}")]
    InvalidEmail(String),

    #[error("card has no {0} field")]
    Unsupported(&'static str),

    #[error("no card record matches {0}")]
    NotFound(String),

    #[error("card group table is full")]
    GroupTableFull,

    #[error("no card group with tag {0}")]
    GroupNotFound(String),

    #[error("card rejected the write: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardLimits {
    pub capacity: u32,
    pub name_max_len: usize,
    pub number_max_len: usize,
    pub supports_email: bool,
    pub supports_anr: bool,
    pub group_capacity: usize,
}

impl Default for CardLimits {
    fn default() -> Self {
        Self {
            capacity: 250,
            name_max_len: 14,
            number_max_len: 20,
            supports_email: true,
            supports_anr: true,
            group_capacity: 10,
        }
    }
}

impl CardLimits {
    /// Names with any code point at or above 0xFF are stored two bytes per
    /// character, halving the room left.
    pub fn max_name_len(&self, name: &str) -> usize {
        if name.chars().any(|c| c as u32 >= 0xFF) {
            self.name_max_len / 2
        } else {
            self.name_max_len
        }
    }

    pub fn check_name(&self, name: &str) -> Result<(), CardError> {
        let max = self.max_name_len(name);
        if name.chars().count() > max {
            return Err(CardError::NameTooLong { max });
        }
        Ok(())
    }

    pub fn check_number(&self, number: &str) -> Result<(), CardError> {
        if number.chars().count() > self.number_max_len {
            return Err(CardError::NumberTooLong {
                max: self.number_max_len,
            });
        }
        if number.contains(NUMBER_SEPARATORS) {
            return Err(CardError::InvalidNumber(number.to_string()));
        }
        Ok(())
    }

    pub fn check(&self, entry: &CardEntry) -> Result<(), CardError> {
        self.check_name(&entry.name)?;
        self.check_number(&entry.number)?;
        if !entry.anr.is_empty() {
            if !self.supports_anr {
                return Err(CardError::Unsupported("ANR"));
            }
            self.check_number(&entry.anr)?;
        }
        if !entry.email.is_empty() {
            if !self.supports_email {
                return Err(CardError::Unsupported("e-mail"));
            }
            if !entry.email.contains('@') {
                return Err(CardError::InvalidEmail(entry.email.clone()));
            }
        }
        Ok(())
    }
}

/// Field content of one card record. Empty strings mean "no value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardEntry {
    pub name: String,
    pub number: String,
    pub anr: String,
    pub email: String,
    /// Comma-joined group tags.
    pub group_tags: String,
}

impl CardEntry {
    pub fn is_blank(&self) -> bool {
        self.name.is_empty() && self.number.is_empty() && self.anr.is_empty() && self.email.is_empty()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.group_tags.split(',').map(str::trim).filter(|t| !t.is_empty())
    }

    fn matches(&self, other: &CardEntry) -> bool {
        self.name == other.name && self.number == other.number
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardRecord {
    pub slot: CardSlot,
    pub entry: CardEntry,
}

/// A write against one record. `None` leaves the field unchanged and
/// `Some("")` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CardWrite {
    pub name: Option<String>,
    pub number: Option<String>,
    pub anr: Option<String>,
    pub email: Option<String>,
    pub group_tags: Option<String>,
}

impl CardWrite {
    pub fn apply_to(&self, entry: &mut CardEntry) {
        let fields = [
            (&self.name, &mut entry.name),
            (&self.number, &mut entry.number),
            (&self.anr, &mut entry.anr),
            (&self.email, &mut entry.email),
            (&self.group_tags, &mut entry.group_tags),
        ];
        for (value, field) in fields {
            if let Some(value) = value {
                field.clone_from(value);
            }
        }
    }

    /// The record this write produces on an empty slot.
    pub fn to_entry(&self) -> CardEntry {
        let mut entry = CardEntry::default();
        self.apply_to(&mut entry);
        entry
    }
}

pub trait CardStore {
    fn limits(&self) -> &CardLimits;

    /// Writes a new record into the first free slot and returns that slot.
    fn insert(&mut self, write: &CardWrite) -> Result<CardSlot, CardError>;

    /// Rewrites the record matching `previous`, preferring `slot_hint`.
    fn update(
        &mut self,
        slot_hint: Option<CardSlot>,
        previous: &CardEntry,
        write: &CardWrite,
    ) -> Result<CardSlot, CardError>;

    fn delete(&mut self, slot_hint: Option<CardSlot>, previous: &CardEntry) -> Result<(), CardError>;

    fn read(&self, slot: CardSlot) -> Result<Option<CardRecord>, CardError>;

    fn records(&self) -> Result<Vec<CardRecord>, CardError>;

    /// Creates a card group and returns its tag.
    fn insert_group(&mut self, label: &str) -> Result<String, CardError>;

    fn rename_group(&mut self, tag: &str, label: &str) -> Result<(), CardError>;

    fn remove_group(&mut self, tag: &str) -> Result<(), CardError>;

    fn add_group_members(&mut self, tag: &str, slots: &[CardSlot]) -> Result<(), CardError>;

    fn remove_group_members(&mut self, tag: &str, slots: &[CardSlot]) -> Result<(), CardError>;
}

/// In-memory card with slots numbered from 1.
#[derive(Debug, Clone)]
pub struct MemoryCard {
    limits: CardLimits,
    slots: Vec<Option<CardEntry>>,
    groups: BTreeMap<String, String>,
    next_group: u32,
}

impl MemoryCard {
    pub fn new(limits: CardLimits) -> Self {
        let slots = vec![None; limits.capacity as usize];
        Self {
            limits,
            slots,
            groups: BTreeMap::new(),
            next_group: 1,
        }
    }

    pub fn group_label(&self, tag: &str) -> Option<&str> {
        self.groups.get(tag).map(String::as_str)
    }

    pub fn used(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn entry_mut(&mut self, slot: CardSlot) -> Option<&mut CardEntry> {
        let index = (slot.index() as usize).checked_sub(1)?;
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    fn locate(&self, slot_hint: Option<CardSlot>, previous: &CardEntry) -> Result<CardSlot, CardError> {
        if let Some(hint) = slot_hint {
            if let Ok(Some(record)) = self.read(hint) {
                if record.entry.matches(previous) {
                    return Ok(hint);
                }
            }
        }
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.matches(previous)))
            .map(|i| CardSlot::new(i as u32 + 1))
            .ok_or_else(|| CardError::NotFound(format!("{:?}/{:?}", previous.name, previous.number)))
    }

    fn retag(&mut self, tag: &str, slots: &[CardSlot], add: bool) -> Result<(), CardError> {
        if !self.groups.contains_key(tag) {
            return Err(CardError::GroupNotFound(tag.to_string()));
        }
        for slot in slots {
            let Some(entry) = self.entry_mut(*slot) else {
                return Err(CardError::NotFound(format!("slot {slot}")));
            };
            let mut tags: Vec<String> = entry.tags().map(str::to_string).collect();
            if add {
                if tags.iter().any(|t| t == tag) {
                    continue;
                }
                tags.push(tag.to_string());
            } else {
                tags.retain(|t| t != tag);
            }
            entry.group_tags = tags.join(",");
        }
        Ok(())
    }
}

impl Default for MemoryCard {
    fn default() -> Self {
        Self::new(CardLimits::default())
    }
}

impl CardStore for MemoryCard {
    fn limits(&self) -> &CardLimits {
        &self.limits
    }

    fn insert(&mut self, write: &CardWrite) -> Result<CardSlot, CardError> {
        let entry = write.to_entry();
        self.limits.check(&entry)?;
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(CardError::Full)?;
        self.slots[index] = Some(entry);
        let slot = CardSlot::new(index as u32 + 1);
        debug!(%slot, "card record inserted");
        Ok(slot)
    }

    fn update(
        &mut self,
        slot_hint: Option<CardSlot>,
        previous: &CardEntry,
        write: &CardWrite,
    ) -> Result<CardSlot, CardError> {
        let slot = self.locate(slot_hint, previous)?;
        let limits = self.limits.clone();
        let entry = self
            .entry_mut(slot)
            .ok_or_else(|| CardError::NotFound(format!("slot {slot}")))?;
        let mut updated = entry.clone();
        write.apply_to(&mut updated);
        limits.check(&updated)?;
        *entry = updated;
        debug!(%slot, "card record updated");
        Ok(slot)
    }

    fn delete(&mut self, slot_hint: Option<CardSlot>, previous: &CardEntry) -> Result<(), CardError> {
        let slot = self.locate(slot_hint, previous)?;
        if let Some(cell) = self.slots.get_mut(slot.index() as usize - 1) {
            *cell = None;
        }
        debug!(%slot, "card record deleted");
        Ok(())
    }

    fn read(&self, slot: CardSlot) -> Result<Option<CardRecord>, CardError> {
        let Some(index) = (slot.index() as usize).checked_sub(1) else {
            return Ok(None);
        };
        Ok(self
            .slots
            .get(index)
            .and_then(Option::as_ref)
            .map(|entry| CardRecord {
                slot,
                entry: entry.clone(),
            }))
    }

    fn records(&self) -> Result<Vec<CardRecord>, CardError> {
        Ok(self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.as_ref().map(|entry| CardRecord {
                    slot: CardSlot::new(i as u32 + 1),
                    entry: entry.clone(),
                })
            })
            .collect())
    }

    fn insert_group(&mut self, label: &str) -> Result<String, CardError> {
        if self.groups.len() >= self.limits.group_capacity {
            return Err(CardError::GroupTableFull);
        }
        let tag = self.next_group.to_string();
        self.next_group += 1;
        self.groups.insert(tag.clone(), label.to_string());
        Ok(tag)
    }

    fn rename_group(&mut self, tag: &str, label: &str) -> Result<(), CardError> {
        let entry = self
            .groups
            .get_mut(tag)
            .ok_or_else(|| CardError::GroupNotFound(tag.to_string()))?;
        *entry = label.to_string();
        Ok(())
    }

    fn remove_group(&mut self, tag: &str) -> Result<(), CardError> {
        if self.groups.remove(tag).is_none() {
            return Err(CardError::GroupNotFound(tag.to_string()));
        }
        for entry in self.slots.iter_mut().flatten() {
            let tags: Vec<&str> = entry.tags().filter(|t| *t != tag).collect();
            entry.group_tags = tags.join(",");
        }
        Ok(())
    }

    fn add_group_members(&mut self, tag: &str, slots: &[CardSlot]) -> Result<(), CardError> {
        self.retag(tag, slots, true)
    }

    fn remove_group_members(&mut self, tag: &str, slots: &[CardSlot]) -> Result<(), CardError> {
        self.retag(tag, slots, false)
    }
}
