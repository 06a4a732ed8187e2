//! Group Reconciliation: idempotent membership edits on the provider, plus
//! the lookups needed to mirror them on a card.

use tracing::debug;

use contactsave_core::{CardSlot, DataKind, GroupId, RawContactId, columns};
use contactsave_storage::schema::data as data_cols;
use contactsave_storage::{ContactStore, ProviderOp, Selection, Target};

use crate::applier::apply;
use crate::error::EngineError;

fn membership_selection(raw_contact_id: RawContactId, group: GroupId) -> Selection {
    Selection::new()
        .eq(data_cols::RAW_CONTACT_ID, raw_contact_id.get())
        .eq(data_cols::MIMETYPE, DataKind::GroupMembership.mimetype())
        .eq(columns::GROUP_ROW_ID, group.get())
}

/// Assert-not-member followed by the insert, as one batch.
pub fn membership_add_ops(raw_contact_id: RawContactId, group: GroupId) -> Vec<ProviderOp> {
    vec![
        ProviderOp::assert(Target::Data)
            .selection(membership_selection(raw_contact_id, group))
            .expected_count(0)
            .build(),
        ProviderOp::insert(Target::Data)
            .value(data_cols::RAW_CONTACT_ID, raw_contact_id.get())
            .value(data_cols::MIMETYPE, DataKind::GroupMembership.mimetype())
            .value(columns::GROUP_ROW_ID, group.get())
            .build(),
    ]
}

/// Adds each raw contact to `group`. Existing memberships count as done.
/// Returns how many memberships were created.
pub fn add_members<S: ContactStore + ?Sized>(
    store: &mut S,
    raw_contact_ids: &[RawContactId],
    group: GroupId,
) -> Result<usize, EngineError> {
    let mut added = 0;
    for id in raw_contact_ids {
        match apply(store, &membership_add_ops(*id, group)) {
            Ok(_) => added += 1,
            Err(EngineError::Conflict(_)) => debug!(raw_contact_id = %id, group = %group, "already a member"),
            Err(e) => return Err(e),
        }
    }
    Ok(added)
}

/// Returns how many memberships were removed.
pub fn remove_members<S: ContactStore + ?Sized>(
    store: &mut S,
    raw_contact_ids: &[RawContactId],
    group: GroupId,
) -> Result<u64, EngineError> {
    let mut removed = 0;
    for id in raw_contact_ids {
        let op = ProviderOp::delete(Target::Data)
            .selection(membership_selection(*id, group))
            .build();
        removed += apply(store, &[op])?.iter().map(|r| r.count).sum::<u64>();
    }
    Ok(removed)
}

/// Card slots of the given raw contacts. Raw contacts without a slot are
/// skipped.
pub fn card_slots<S: ContactStore + ?Sized>(
    store: &S,
    raw_contact_ids: &[RawContactId],
) -> Result<Vec<CardSlot>, EngineError> {
    let mut slots = Vec::with_capacity(raw_contact_ids.len());
    for id in raw_contact_ids {
        if let Some(slot) = store.raw_contact_info(*id)?.and_then(|info| info.card_slot) {
            slots.push(slot);
        }
    }
    Ok(slots)
}

/// Comma-joined card tags of the groups a raw contact belongs to, in
/// membership order.
pub fn card_tags_for<S: ContactStore + ?Sized>(store: &S, groups: &[GroupId]) -> Result<String, EngineError> {
    let mut tags = Vec::new();
    for group in groups {
        if let Some(tag) = store.group(*group)?.and_then(|g| g.source_id) {
            if !tag.is_empty() {
                tags.push(tag);
            }
        }
    }
    Ok(tags.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contactsave_core::Account;
    use contactsave_storage::SqliteProvider;
    use contactsave_storage::schema::groups as group_cols;
    use contactsave_storage::schema::raw_contacts as rc;

    fn setup() -> (SqliteProvider, RawContactId, GroupId) {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let account = Account::local();
        let results = store
            .apply_batch(&[
                ProviderOp::insert(Target::RawContacts)
                    .value(rc::ACCOUNT_TYPE, account.account_type.as_str())
                    .value(rc::ACCOUNT_NAME, account.account_name.as_str())
                    .build(),
                ProviderOp::insert(Target::Groups)
                    .value(group_cols::ACCOUNT_TYPE, account.account_type.as_str())
                    .value(group_cols::ACCOUNT_NAME, account.account_name.as_str())
                    .value(group_cols::TITLE, "Friends")
                    .build(),
            ])
            .unwrap();
        (
            store,
            RawContactId::new(results[0].inserted_id.unwrap()),
            GroupId::new(results[1].inserted_id.unwrap()),
        )
    }

    #[test]
    fn add_is_idempotent() {
        let (mut store, raw, group) = setup();
        assert_eq!(add_members(&mut store, &[raw], group).unwrap(), 1);
        assert_eq!(add_members(&mut store, &[raw], group).unwrap(), 0);
        assert_eq!(store.group_ids_for_raw_contact(raw).unwrap(), vec![group]);
    }

    #[test]
    fn remove_of_non_member_is_a_noop() {
        let (mut store, raw, group) = setup();
        assert_eq!(remove_members(&mut store, &[raw], group).unwrap(), 0);
        add_members(&mut store, &[raw], group).unwrap();
        assert_eq!(remove_members(&mut store, &[raw], group).unwrap(), 1);
        assert!(store.group_ids_for_raw_contact(raw).unwrap().is_empty());
    }

    #[test]
    fn tags_skip_groups_without_source() {
        let (store, _, group) = setup();
        assert_eq!(card_tags_for(&store, &[group]).unwrap(), "");
    }
}
