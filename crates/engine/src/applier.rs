//! Transactional Batch Applier with bounded retry.
//!
//! A batch either commits whole or not at all. When a version assert fails
//! the model is reparented onto fresh snapshots of the same raw contacts
//! and the diff is rebuilt; transport failures are surfaced immediately.

use tracing::{debug, info, warn};

use contactsave_core::{FieldDeltaModel, RawContactId, reparent};
use contactsave_storage::{ContactStore, OpKind, OpResult, ProviderOp, Target};

use crate::diff::{DiffOptions, build_diff};
use crate::error::EngineError;

pub fn apply<S: ContactStore + ?Sized>(store: &mut S, ops: &[ProviderOp]) -> Result<Vec<OpResult>, EngineError> {
    store.apply_batch(ops).map_err(EngineError::from_batch)
}

/// Id produced by the first raw contact insert of an applied batch.
pub fn inserted_raw_contact_id(ops: &[ProviderOp], results: &[OpResult]) -> Option<RawContactId> {
    ops.iter()
        .zip(results)
        .find(|(op, _)| op.kind == OpKind::Insert && op.target == Target::RawContacts)
        .and_then(|(_, result)| result.inserted_id)
        .map(RawContactId::new)
}

#[derive(Debug)]
pub struct Persisted {
    /// Apply attempts made, including the successful one.
    pub attempts: u32,
    pub inserted_raw_contact_id: Option<RawContactId>,
    /// The model as finally applied, after any reparenting.
    pub model: FieldDeltaModel,
}

pub fn persist_with_retry<S: ContactStore + ?Sized>(
    store: &mut S,
    mut model: FieldDeltaModel,
    tries: u32,
    options: &DiffOptions,
) -> Result<Persisted, EngineError> {
    let tries = tries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let ops = build_diff(&model, options);
        if ops.is_empty() {
            debug!(attempt, "nothing to persist");
            return Ok(Persisted {
                attempts: attempt,
                inserted_raw_contact_id: None,
                model,
            });
        }

        match apply(store, &ops) {
            Ok(results) => {
                info!(attempt, ops = ops.len(), "batch persisted");
                return Ok(Persisted {
                    attempts: attempt,
                    inserted_raw_contact_id: inserted_raw_contact_id(&ops, &results),
                    model,
                });
            }
            Err(EngineError::Conflict(reason)) => {
                warn!(attempt, tries, %reason, "version conflict");
                if attempt >= tries {
                    return Err(EngineError::RetriesExhausted { attempts: attempt });
                }
                let ids = model.existing_raw_contact_ids();
                if ids.is_empty() {
                    return Err(EngineError::InconsistentState(
                        "version consistency failed for a new contact".into(),
                    ));
                }
                let fresh = store.load_raw_contacts(&ids)?;
                model = reparent(&model, &fresh);
            }
            Err(e) => {
                warn!(attempt, error = %e, "batch failed");
                return Err(e);
            }
        }
    }
}
