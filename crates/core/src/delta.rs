use serde::{Deserialize, Serialize};

use crate::account::{Account, AggregationMode};
use crate::data::{DataKind, DataRow, DataValues};
use crate::field_value::FieldValue;
use crate::ids::{CardSlot, DataId, RawContactId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditKind {
    Insert,
    Update,
    Delete,
    NoOp,
}

/// Persisted attributes of a raw contact row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContactState {
    pub id: Option<RawContactId>,
    pub account: Account,
    pub version: i64,
    pub aggregation_mode: AggregationMode,
    pub name_verified: bool,
    pub is_profile: bool,
    /// Card record index for card-backed raw contacts.
    pub card_slot: Option<CardSlot>,
}

impl RawContactState {
    pub fn new(account: Account) -> Self {
        Self {
            id: None,
            account,
            version: 0,
            aggregation_mode: AggregationMode::Default,
            name_verified: false,
            is_profile: false,
            card_slot: None,
        }
    }
}

/// A raw contact as currently persisted, with all of its data rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContactSnapshot {
    pub state: RawContactState,
    pub data: Vec<DataRow>,
}

impl RawContactSnapshot {
    pub fn id(&self) -> Option<RawContactId> {
        self.state.id
    }

    pub fn rows(&self, kind: &DataKind) -> impl Iterator<Item = &DataRow> {
        let kind = kind.clone();
        self.data.iter().filter(move |r| r.kind == kind)
    }
}

/// Edit of a single data row: the persisted snapshot (absent for inserts)
/// and the value the user wants (absent for deletes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataDelta {
    kind: DataKind,
    before: Option<DataRow>,
    after: Option<DataRow>,
}

impl DataDelta {
    pub fn insert(row: DataRow) -> Self {
        Self {
            kind: row.kind.clone(),
            before: None,
            after: Some(DataRow { id: None, ..row }),
        }
    }

    pub fn existing(row: DataRow) -> Self {
        Self {
            kind: row.kind.clone(),
            before: Some(row.clone()),
            after: Some(row),
        }
    }

    pub(crate) fn from_parts(kind: DataKind, before: Option<DataRow>, after: Option<DataRow>) -> Self {
        Self { kind, before, after }
    }

    pub fn kind(&self) -> &DataKind {
        &self.kind
    }

    pub fn before(&self) -> Option<&DataRow> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&DataRow> {
        self.after.as_ref()
    }

    pub fn after_mut(&mut self) -> Option<&mut DataRow> {
        self.after.as_mut()
    }

    pub fn data_id(&self) -> Option<DataId> {
        self.before.as_ref().and_then(|r| r.id)
    }

    pub fn is_insert(&self) -> bool {
        self.edit_kind() == EditKind::Insert
    }

    pub fn is_delete(&self) -> bool {
        self.edit_kind() == EditKind::Delete
    }

    pub fn edit_kind(&self) -> EditKind {
        match (&self.before, &self.after) {
            (None, Some(_)) => EditKind::Insert,
            (Some(_), None) => EditKind::Delete,
            (None, None) => EditKind::NoOp,
            (Some(before), Some(after)) => {
                if before.values == after.values
                    && before.is_primary == after.is_primary
                    && before.is_super_primary == after.is_super_primary
                {
                    EditKind::NoOp
                } else {
                    EditKind::Update
                }
            }
        }
    }

    /// Sets a column on the pending value. Returns false for deleted rows.
    pub fn set(&mut self, column: &str, value: impl Into<FieldValue>) -> bool {
        match self.after.as_mut() {
            Some(row) => {
                row.values.insert(column.to_string(), value.into());
                true
            }
            None => false,
        }
    }

    pub fn mark_deleted(&mut self) {
        self.after = None;
    }

    /// Columns whose pending value differs from the persisted one. Columns
    /// dropped from the pending value are reported as `Null`.
    pub fn changed_values(&self) -> DataValues {
        let mut changed = DataValues::new();
        let Some(after) = &self.after else {
            return changed;
        };
        match &self.before {
            None => changed = after.values.clone(),
            Some(before) => {
                for (column, value) in &after.values {
                    if before.values.get(column) != Some(value) {
                        changed.insert(column.clone(), value.clone());
                    }
                }
                for column in before.values.keys() {
                    if !after.values.contains_key(column) {
                        changed.insert(column.clone(), FieldValue::Null);
                    }
                }
            }
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawContactDelta {
    account: Account,
    before: Option<RawContactState>,
    after: Option<RawContactState>,
    data: Vec<DataDelta>,
}

impl RawContactDelta {
    pub fn insert(account: Account) -> Self {
        Self {
            account: account.clone(),
            before: None,
            after: Some(RawContactState::new(account)),
            data: Vec::new(),
        }
    }

    pub fn from_snapshot(snapshot: RawContactSnapshot) -> Self {
        Self {
            account: snapshot.state.account.clone(),
            before: Some(snapshot.state.clone()),
            after: Some(snapshot.state),
            data: snapshot.data.into_iter().map(DataDelta::existing).collect(),
        }
    }

    pub(crate) fn from_parts(
        account: Account,
        before: Option<RawContactState>,
        after: Option<RawContactState>,
        data: Vec<DataDelta>,
    ) -> Self {
        Self {
            account,
            before,
            after,
            data,
        }
    }

    pub fn with_data(mut self, row: DataRow) -> Self {
        self.data.push(DataDelta::insert(row));
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn before(&self) -> Option<&RawContactState> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&RawContactState> {
        self.after.as_ref()
    }

    pub fn after_mut(&mut self) -> Option<&mut RawContactState> {
        self.after.as_mut()
    }

    /// Store-assigned id, `None` until the raw contact has been inserted.
    pub fn raw_contact_id(&self) -> Option<RawContactId> {
        self.before.as_ref().and_then(|s| s.id)
    }

    pub fn is_insert(&self) -> bool {
        self.before.is_none() && self.after.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    pub fn edit_kind(&self) -> EditKind {
        match (&self.before, &self.after) {
            (None, Some(_)) => EditKind::Insert,
            (Some(_), None) => EditKind::Delete,
            (None, None) => EditKind::NoOp,
            (Some(before), Some(after)) => {
                if before != after || self.data.iter().any(|d| d.edit_kind() != EditKind::NoOp) {
                    EditKind::Update
                } else {
                    EditKind::NoOp
                }
            }
        }
    }

    pub fn mark_deleted(&mut self) {
        self.after = None;
    }

    pub fn data(&self) -> &[DataDelta] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<DataDelta> {
        &mut self.data
    }

    pub fn add(&mut self, delta: DataDelta) {
        self.data.push(delta);
    }

    pub fn entries<'a>(&'a self, kind: &'a DataKind) -> impl Iterator<Item = &'a DataDelta> + 'a {
        self.data.iter().filter(move |d| d.kind() == kind)
    }

    pub fn entries_mut<'a>(
        &'a mut self,
        kind: &'a DataKind,
    ) -> impl Iterator<Item = &'a mut DataDelta> + 'a {
        self.data.iter_mut().filter(move |d| d.kind() == kind)
    }

    /// The super-primary entry of a kind, else the primary one, else the
    /// first live entry.
    pub fn primary_entry<'a>(&'a self, kind: &'a DataKind) -> Option<&'a DataDelta> {
        let live = || self.entries(kind).filter(|d| d.after().is_some());
        live()
            .find(|d| d.after().is_some_and(|r| r.is_super_primary))
            .or_else(|| live().find(|d| d.after().is_some_and(|r| r.is_primary)))
            .or_else(|| live().next())
    }

    fn has_content(&self) -> bool {
        self.data.iter().any(|d| {
            !matches!(d.kind(), DataKind::GroupMembership)
                && d.after().is_some_and(|r| !r.is_empty())
        })
    }
}

/// The edit set handed to the save core: one delta per raw contact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDeltaModel {
    raw_contacts: Vec<RawContactDelta>,
}

impl FieldDeltaModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(delta: RawContactDelta) -> Self {
        Self {
            raw_contacts: vec![delta],
        }
    }

    pub fn push(&mut self, delta: RawContactDelta) {
        self.raw_contacts.push(delta);
    }

    pub fn len(&self) -> usize {
        self.raw_contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw_contacts.is_empty()
    }

    pub fn raw_contacts(&self) -> &[RawContactDelta] {
        &self.raw_contacts
    }

    pub fn raw_contacts_mut(&mut self) -> &mut Vec<RawContactDelta> {
        &mut self.raw_contacts
    }

    pub fn get(&self, index: usize) -> Option<&RawContactDelta> {
        self.raw_contacts.get(index)
    }

    /// Ids of every raw contact in the model that already exists in the store.
    pub fn existing_raw_contact_ids(&self) -> Vec<RawContactId> {
        self.raw_contacts
            .iter()
            .filter_map(RawContactDelta::raw_contact_id)
            .collect()
    }

    /// First persisted raw contact id, if any.
    pub fn find_raw_contact_id(&self) -> Option<RawContactId> {
        self.raw_contacts
            .iter()
            .find_map(RawContactDelta::raw_contact_id)
    }

    pub fn has_changes(&self) -> bool {
        self.raw_contacts
            .iter()
            .any(|d| d.edit_kind() != EditKind::NoOp)
    }

    /// Emptied rows become deletes, or vanish if they were never persisted.
    /// Inserted raw contacts left without content are dropped.
    pub fn trim_empty(&mut self) {
        for delta in &mut self.raw_contacts {
            delta.data.retain_mut(|entry| {
                let emptied = entry.after().is_some_and(DataRow::is_empty);
                if !emptied {
                    return true;
                }
                if entry.before().is_some() {
                    entry.mark_deleted();
                    true
                } else {
                    false
                }
            });
        }
        self.raw_contacts
            .retain(|delta| !delta.is_insert() || delta.has_content());
    }

    /// Drops no-op data deltas and transient raw contacts.
    pub fn prune_noops(&mut self) {
        for delta in &mut self.raw_contacts {
            delta.data.retain(|d| d.edit_kind() != EditKind::NoOp);
        }
        self.raw_contacts
            .retain(|delta| !(delta.before.is_none() && delta.after.is_none()));
    }

    /// Keeps at most one super-primary row per kind per raw contact: the
    /// first one in model order wins.
    pub fn normalize_super_primary(&mut self) {
        for delta in &mut self.raw_contacts {
            let mut seen: Vec<DataKind> = Vec::new();
            for entry in &mut delta.data {
                let kind = entry.kind().clone();
                let Some(row) = entry.after_mut() else {
                    continue;
                };
                if !row.is_super_primary {
                    continue;
                }
                if seen.contains(&kind) {
                    row.is_super_primary = false;
                } else {
                    seen.push(kind);
                }
            }
        }
    }
}

impl From<Vec<RawContactDelta>> for FieldDeltaModel {
    fn from(raw_contacts: Vec<RawContactDelta>) -> Self {
        Self { raw_contacts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{columns, EmailType, PhoneType};
    use crate::ids::DataId;

    fn persisted(id: i64) -> RawContactSnapshot {
        let mut state = RawContactState::new(Account::local());
        state.id = Some(RawContactId::new(id));
        state.version = 3;
        RawContactSnapshot {
            state,
            data: vec![
                DataRow::name("Jane").with_id(DataId::new(10)),
                DataRow::phone("5551234", PhoneType::Mobile).with_id(DataId::new(11)),
            ],
        }
    }

    #[test]
    fn untouched_snapshot_is_noop() {
        let delta = RawContactDelta::from_snapshot(persisted(1));
        assert_eq!(delta.edit_kind(), EditKind::NoOp);
        let mut model = FieldDeltaModel::single(delta);
        assert!(!model.has_changes());
        model.prune_noops();
        assert!(model.raw_contacts()[0].data().is_empty());
    }

    #[test]
    fn edit_kinds() {
        let row = DataRow::email("a@b.c", EmailType::Home).with_id(DataId::new(5));
        let mut delta = DataDelta::existing(row.clone());
        assert_eq!(delta.edit_kind(), EditKind::NoOp);
        delta.set(columns::ADDRESS, "x@y.z");
        assert_eq!(delta.edit_kind(), EditKind::Update);
        assert_eq!(delta.changed_values().len(), 1);
        delta.mark_deleted();
        assert_eq!(delta.edit_kind(), EditKind::Delete);
        assert!(!delta.set(columns::ADDRESS, "ignored"));
        assert_eq!(DataDelta::insert(row).edit_kind(), EditKind::Insert);
    }

    #[test]
    fn removed_column_reported_as_null() {
        let row = DataRow::name("Jane").with(columns::GIVEN_NAME, "Jane");
        let mut delta = DataDelta::existing(row.with_id(DataId::new(1)));
        delta.after_mut().unwrap().values.remove(columns::GIVEN_NAME);
        let changed = delta.changed_values();
        assert_eq!(changed.get(columns::GIVEN_NAME), Some(&FieldValue::Null));
    }

    #[test]
    fn trim_converts_emptied_rows() {
        let mut delta = RawContactDelta::from_snapshot(persisted(1));
        delta.data_mut()[1].set(columns::NUMBER, "");
        delta.add(DataDelta::insert(DataRow::email("", EmailType::Home)));
        let mut model = FieldDeltaModel::single(delta);
        model.trim_empty();

        let delta = &model.raw_contacts()[0];
        assert_eq!(delta.data().len(), 2);
        assert!(delta.data()[1].is_delete());
    }

    #[test]
    fn trim_drops_empty_insert() {
        let mut model = FieldDeltaModel::new();
        model.push(
            RawContactDelta::insert(Account::local())
                .with_data(DataRow::name(" "))
                .with_data(DataRow::group_membership(crate::ids::GroupId::new(4))),
        );
        model.trim_empty();
        assert!(model.is_empty());
    }

    #[test]
    fn super_primary_normalized() {
        let mut model = FieldDeltaModel::single(
            RawContactDelta::insert(Account::local())
                .with_data(DataRow::phone("1", PhoneType::Mobile).super_primary())
                .with_data(DataRow::phone("2", PhoneType::Home).super_primary()),
        );
        model.normalize_super_primary();
        let data = model.raw_contacts()[0].data();
        assert!(data[0].after().unwrap().is_super_primary);
        assert!(!data[1].after().unwrap().is_super_primary);
    }

    #[test]
    fn primary_entry_prefers_super_primary() {
        let delta = RawContactDelta::insert(Account::local())
            .with_data(DataRow::phone("1", PhoneType::Mobile))
            .with_data(DataRow::phone("2", PhoneType::Home).super_primary());
        let primary = delta.primary_entry(&DataKind::Phone).unwrap();
        assert_eq!(primary.after().unwrap().text(columns::NUMBER), Some("2"));
    }

    #[test]
    fn primary_entry_skips_deleted_rows() {
        let mut delta = RawContactDelta::from_snapshot(persisted(7));
        let kind = DataKind::Phone;
        for entry in delta.entries_mut(&kind) {
            entry.mark_deleted();
        }
        assert!(delta.primary_entry(&kind).is_none());
        delta.add(DataDelta::insert(DataRow::phone("3", PhoneType::Work)));
        let entry = delta.primary_entry(&kind).unwrap();
        assert_eq!(entry.after().unwrap().text(columns::NUMBER), Some("3"));
    }
}
