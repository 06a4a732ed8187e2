//! Rebasing a pending edit onto freshly reloaded state.
//!
//! A pending [`FieldDeltaModel`] carries two things per row: the baseline
//! it was built from (`before`) and the values the user wants (`after`).
//! When the store rejects a batch because the baseline went stale, the
//! applier reloads the affected raw contacts and calls [`reparent`] to get
//! a model whose baseline is the reloaded state and whose intent is
//! unchanged. Columns the user never touched keep whatever the other
//! writer stored.

use std::collections::BTreeSet;

use crate::data::DataRow;
use crate::delta::{DataDelta, FieldDeltaModel, RawContactDelta, RawContactSnapshot, RawContactState};

pub fn reparent(pending: &FieldDeltaModel, fresh: &[RawContactSnapshot]) -> FieldDeltaModel {
    let mut merged = FieldDeltaModel::new();
    for delta in pending.raw_contacts() {
        let Some(id) = delta.raw_contact_id() else {
            merged.push(delta.clone());
            continue;
        };
        if let Some(snapshot) = fresh.iter().find(|s| s.id() == Some(id)) {
            merged.push(reparent_raw_contact(delta, snapshot));
        }
    }
    merged
}

fn reparent_raw_contact(delta: &RawContactDelta, snapshot: &RawContactSnapshot) -> RawContactDelta {
    let fresh_state = snapshot.state.clone();
    let after = delta
        .after()
        .map(|intent| merge_state(delta.before(), intent, &fresh_state));

    let mut data = Vec::with_capacity(snapshot.data.len() + delta.data().len());
    let mut touched = BTreeSet::new();

    for entry in delta.data() {
        let Some(data_id) = entry.data_id() else {
            if entry.after().is_some() {
                data.push(entry.clone());
            }
            continue;
        };
        touched.insert(data_id);
        let fresh_row = snapshot.data.iter().find(|r| r.id == Some(data_id));
        match (fresh_row, entry.after()) {
            (Some(fresh_row), None) => {
                data.push(DataDelta::from_parts(
                    entry.kind().clone(),
                    Some(fresh_row.clone()),
                    None,
                ));
            }
            (Some(fresh_row), Some(intent)) => {
                let merged = match entry.before() {
                    Some(stale) => merge_row(stale, intent, fresh_row),
                    None => intent.clone(),
                };
                data.push(DataDelta::from_parts(
                    entry.kind().clone(),
                    Some(fresh_row.clone()),
                    Some(merged),
                ));
            }
            (None, Some(intent)) => data.push(DataDelta::insert(intent.clone())),
            (None, None) => {}
        }
    }

    for row in &snapshot.data {
        if row.id.is_some_and(|id| !touched.contains(&id)) {
            data.push(DataDelta::existing(row.clone()));
        }
    }

    RawContactDelta::from_parts(delta.account().clone(), Some(fresh_state), after, data)
}

fn merge_state(
    stale: Option<&RawContactState>,
    intent: &RawContactState,
    fresh: &RawContactState,
) -> RawContactState {
    let mut merged = fresh.clone();
    let Some(stale) = stale else {
        return merged;
    };
    if stale.aggregation_mode != intent.aggregation_mode {
        merged.aggregation_mode = intent.aggregation_mode;
    }
    if stale.name_verified != intent.name_verified {
        merged.name_verified = intent.name_verified;
    }
    if stale.card_slot != intent.card_slot {
        merged.card_slot = intent.card_slot;
    }
    merged
}

/// Applies the columns changed between `stale` and `intent` on top of `fresh`.
fn merge_row(stale: &DataRow, intent: &DataRow, fresh: &DataRow) -> DataRow {
    let mut merged = fresh.clone();
    let columns: BTreeSet<&String> = stale.values.keys().chain(intent.values.keys()).collect();
    for column in columns {
        let before = stale.values.get(column);
        let after = intent.values.get(column);
        if before == after {
            continue;
        }
        match after {
            Some(value) => {
                merged.values.insert(column.clone(), value.clone());
            }
            None => {
                merged.values.remove(column);
            }
        }
    }
    if stale.is_primary != intent.is_primary {
        merged.is_primary = intent.is_primary;
    }
    if stale.is_super_primary != intent.is_super_primary {
        merged.is_super_primary = intent.is_super_primary;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Account;
    use crate::data::{columns, EmailType, PhoneType};
    use crate::delta::EditKind;
    use crate::ids::{DataId, RawContactId};

    fn snapshot(version: i64, name: &str, email: &str) -> RawContactSnapshot {
        let mut state = RawContactState::new(Account::local());
        state.id = Some(RawContactId::new(7));
        state.version = version;
        RawContactSnapshot {
            state,
            data: vec![
                DataRow::name(name).with_id(DataId::new(1)),
                DataRow::email(email, EmailType::Home).with_id(DataId::new(2)),
            ],
        }
    }

    fn edit_email(base: RawContactSnapshot, address: &str) -> FieldDeltaModel {
        let mut delta = RawContactDelta::from_snapshot(base);
        delta.data_mut()[1].set(columns::ADDRESS, address);
        FieldDeltaModel::single(delta)
    }

    #[test]
    fn keeps_intent_and_fresh_untouched_columns() {
        let pending = edit_email(snapshot(1, "Jane", "old@x.org"), "new@x.org");
        let fresh = snapshot(2, "Janet", "old@x.org");

        let merged = reparent(&pending, &[fresh]);
        let delta = &merged.raw_contacts()[0];
        assert_eq!(delta.before().unwrap().version, 2);

        let name = &delta.data()[0];
        assert_eq!(name.edit_kind(), EditKind::NoOp);
        assert_eq!(name.after().unwrap().text(columns::DISPLAY_NAME), Some("Janet"));

        let email = &delta.data()[1];
        assert_eq!(email.edit_kind(), EditKind::Update);
        assert_eq!(email.after().unwrap().text(columns::ADDRESS), Some("new@x.org"));
    }

    #[test]
    fn vanished_row_update_becomes_insert() {
        let pending = edit_email(snapshot(1, "Jane", "old@x.org"), "new@x.org");
        let mut fresh = snapshot(2, "Jane", "old@x.org");
        fresh.data.truncate(1);

        let merged = reparent(&pending, &[fresh]);
        let email = &merged.raw_contacts()[0].data()[1];
        assert!(email.is_insert());
        assert_eq!(email.after().unwrap().id, None);
    }

    #[test]
    fn vanished_row_delete_is_dropped() {
        let mut delta = RawContactDelta::from_snapshot(snapshot(1, "Jane", "old@x.org"));
        delta.data_mut()[1].mark_deleted();
        let pending = FieldDeltaModel::single(delta);
        let mut fresh = snapshot(2, "Jane", "old@x.org");
        fresh.data.truncate(1);

        let merged = reparent(&pending, &[fresh]);
        assert_eq!(merged.raw_contacts()[0].data().len(), 1);
    }

    #[test]
    fn rows_added_concurrently_are_kept() {
        let pending = edit_email(snapshot(1, "Jane", "old@x.org"), "new@x.org");
        let mut fresh = snapshot(2, "Jane", "old@x.org");
        fresh
            .data
            .push(DataRow::phone("5550000", PhoneType::Work).with_id(DataId::new(3)));

        let merged = reparent(&pending, &[fresh]);
        let data = merged.raw_contacts()[0].data();
        assert_eq!(data.len(), 3);
        assert_eq!(data[2].edit_kind(), EditKind::NoOp);
    }

    #[test]
    fn inserts_survive_and_vanished_raw_contacts_drop() {
        let mut pending = edit_email(snapshot(1, "Jane", "a@b.c"), "d@e.f");
        pending.push(RawContactDelta::insert(Account::local()).with_data(DataRow::name("New")));

        let merged = reparent(&pending, &[]);
        assert_eq!(merged.len(), 1);
        assert!(merged.raw_contacts()[0].is_insert());
    }
}
