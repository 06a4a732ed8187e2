//! Aggregation Merge Builder: keep-together exceptions for every pair of
//! raw contacts behind two contacts, plus the name-verified pick.

use std::collections::BTreeSet;

use tracing::info;

use contactsave_core::{ContactId, ContactRef, RawContactId};
use contactsave_storage::schema::{exceptions, raw_contacts as rc};
use contactsave_storage::{ContactStore, ExceptionType, ProviderOp, Target};

use crate::applier::apply;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCandidate {
    pub raw_contact_id: RawContactId,
    pub contact_id: ContactId,
    pub name_verified: bool,
    pub display_name_source: i64,
}

/// Raw contact of `primary` whose name should win after the join: among
/// those carrying the best name source of the whole set, the first one,
/// unless a later one is already name-verified.
pub fn verified_name_pick(candidates: &[JoinCandidate], primary: ContactId) -> Option<RawContactId> {
    let best = candidates.iter().map(|c| c.display_name_source).max()?;
    let mut pick: Option<&JoinCandidate> = None;
    for candidate in candidates {
        if candidate.contact_id != primary || candidate.display_name_source != best {
            continue;
        }
        match pick {
            None => pick = Some(candidate),
            Some(_) if candidate.name_verified => pick = Some(candidate),
            Some(_) => {}
        }
    }
    pick.map(|c| c.raw_contact_id)
}

fn keep_together(id1: RawContactId, id2: RawContactId) -> ProviderOp {
    ProviderOp::update(Target::AggregationExceptions)
        .value(exceptions::TYPE, ExceptionType::KeepTogether.code())
        .value(exceptions::RAW_CONTACT_ID1, id1.get())
        .value(exceptions::RAW_CONTACT_ID2, id2.get())
        .build()
}

pub fn build_join_ops(candidates: &[JoinCandidate], primary: ContactId, writable: bool) -> Vec<ProviderOp> {
    let mut ops = Vec::new();
    for (i, first) in candidates.iter().enumerate() {
        for (j, second) in candidates.iter().enumerate() {
            if i != j {
                ops.push(keep_together(first.raw_contact_id, second.raw_contact_id));
            }
        }
    }
    if writable {
        if let Some(id) = verified_name_pick(candidates, primary) {
            ops.push(
                ProviderOp::update(Target::RawContacts)
                    .with_selection(rc::ID, id.get())
                    .value(rc::NAME_VERIFIED, true)
                    .build(),
            );
        }
    }
    ops
}

/// Merges `contact_id2` into `contact_id1` in one batch and returns the
/// reference of the resulting contact.
pub fn join_contacts<S: ContactStore + ?Sized>(
    store: &mut S,
    contact_id1: ContactId,
    contact_id2: ContactId,
    writable: bool,
) -> Result<ContactRef, EngineError> {
    let mut seen = BTreeSet::new();
    let mut candidates = Vec::new();
    for contact_id in [contact_id1, contact_id2] {
        for info in store.raw_contacts_for_contact(contact_id)? {
            if seen.insert(info.id) {
                candidates.push(JoinCandidate {
                    raw_contact_id: info.id,
                    contact_id,
                    name_verified: info.name_verified,
                    display_name_source: info.display_name_source,
                });
            }
        }
    }
    candidates.sort_by_key(|c| c.raw_contact_id);
    let Some(first) = candidates.first().map(|c| c.raw_contact_id) else {
        return Err(EngineError::NotFound(format!("contacts {contact_id1} and {contact_id2}")));
    };

    let ops = build_join_ops(&candidates, contact_id1, writable);
    if !ops.is_empty() {
        apply(store, &ops)?;
    }
    info!(contact_id1 = %contact_id1, contact_id2 = %contact_id2, raw_contacts = candidates.len(), "contacts joined");
    store
        .contact_ref_for_raw_contact(first)?
        .ok_or_else(|| EngineError::InconsistentState(format!("raw contact {first} has no contact after join")))
}
