//! Batch Diff Builder: turns a [`FieldDeltaModel`] into provider ops.
//!
//! Layout of a batch:
//! 1. one version assert per persisted raw contact in the model,
//! 2. per raw contact, its own ops wrapped in an aggregation bracket.
//!
//! Data rows of a raw contact inserted in the same batch point at it with a
//! back reference to the insert's position.

use contactsave_core::{
    AggregationMode, CardSlot, DataDelta, EditKind, FieldDeltaModel, FieldValue, RawContactDelta,
    RawContactId, RawContactState, columns,
};
use contactsave_storage::schema::{data as data_cols, raw_contacts as rc};
use contactsave_storage::{ProviderOp, ProviderOpBuilder, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawContactTarget {
    Existing(RawContactId),
    /// Inserted by the op at this batch position.
    Inserted(usize),
}

impl RawContactTarget {
    fn select(self, builder: ProviderOpBuilder) -> ProviderOpBuilder {
        match self {
            Self::Existing(id) => builder.with_selection(rc::ID, id.get()),
            Self::Inserted(index) => builder.selection_back_reference(rc::ID, index),
        }
    }

    fn parent(self, builder: ProviderOpBuilder) -> ProviderOpBuilder {
        match self {
            Self::Existing(id) => builder.value(data_cols::RAW_CONTACT_ID, id.get()),
            Self::Inserted(index) => builder.back_reference(data_cols::RAW_CONTACT_ID, index),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    /// Mode restored on new raw contacts once their bracket closes.
    pub restore_mode: AggregationMode,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            restore_mode: AggregationMode::Default,
        }
    }
}

pub fn set_aggregation_mode(target: RawContactTarget, mode: AggregationMode) -> ProviderOp {
    target
        .select(ProviderOp::update(Target::RawContacts))
        .value(rc::AGGREGATION_MODE, mode.code())
        .build()
}

pub fn version_assert(id: RawContactId, version: i64) -> ProviderOp {
    ProviderOp::assert(Target::RawContacts)
        .with_selection(rc::ID, id.get())
        .value(rc::VERSION, version)
        .expected_count(1)
        .build()
}

/// Suspends aggregation on `target` around whatever `body` pushes, then
/// restores `restore`. Emits nothing when the body adds no ops.
pub fn with_aggregation_suspended<F>(
    ops: &mut Vec<ProviderOp>,
    target: RawContactTarget,
    restore: AggregationMode,
    body: F,
) where
    F: FnOnce(&mut Vec<ProviderOp>),
{
    let mark = ops.len();
    ops.push(set_aggregation_mode(target, AggregationMode::Suspended));
    body(ops);
    if ops.len() == mark + 1 {
        ops.truncate(mark);
        return;
    }
    ops.push(set_aggregation_mode(target, restore));
}

pub fn build_diff(model: &FieldDeltaModel, options: &DiffOptions) -> Vec<ProviderOp> {
    let mut ops = Vec::new();
    for delta in model.raw_contacts() {
        if let (Some(id), Some(before)) = (delta.raw_contact_id(), delta.before()) {
            ops.push(version_assert(id, before.version));
        }
    }
    let asserts = ops.len();

    for delta in model.raw_contacts() {
        build_raw_contact_diff(&mut ops, delta, options);
    }

    if ops.len() == asserts {
        ops.clear();
    }
    ops
}

fn restore_mode(delta: &RawContactDelta, options: &DiffOptions) -> AggregationMode {
    let suspended = AggregationMode::Suspended;
    match (delta.before(), delta.after()) {
        (Some(before), Some(after)) => {
            if after.aggregation_mode != before.aggregation_mode && after.aggregation_mode != suspended {
                after.aggregation_mode
            } else if before.aggregation_mode != suspended {
                before.aggregation_mode
            } else {
                options.restore_mode
            }
        }
        (None, Some(after))
            if after.aggregation_mode != AggregationMode::Default && after.aggregation_mode != suspended =>
        {
            after.aggregation_mode
        }
        _ => options.restore_mode,
    }
}

fn build_raw_contact_diff(ops: &mut Vec<ProviderOp>, delta: &RawContactDelta, options: &DiffOptions) {
    match delta.edit_kind() {
        EditKind::NoOp => {}
        EditKind::Delete => {
            if let Some(id) = delta.raw_contact_id() {
                ops.push(
                    ProviderOp::delete(Target::RawContacts)
                        .with_selection(rc::ID, id.get())
                        .build(),
                );
            }
        }
        EditKind::Insert => {
            let Some(state) = delta.after() else {
                return;
            };
            let index = ops.len();
            ops.push(raw_contact_insert(state));
            let target = RawContactTarget::Inserted(index);
            for entry in delta.data() {
                push_data_op(ops, target, entry);
            }
            ops.push(set_aggregation_mode(target, restore_mode(delta, options)));
        }
        EditKind::Update => {
            let (Some(id), Some(before), Some(after)) = (delta.raw_contact_id(), delta.before(), delta.after())
            else {
                return;
            };
            let target = RawContactTarget::Existing(id);
            let restore = restore_mode(delta, options);
            let mark = ops.len();
            with_aggregation_suspended(ops, target, restore, |ops| {
                if let Some(op) = state_update(target, before, after) {
                    ops.push(op);
                }
                for entry in delta.data() {
                    push_data_op(ops, target, entry);
                }
            });
            if ops.len() == mark && before.aggregation_mode != after.aggregation_mode {
                ops.push(set_aggregation_mode(target, after.aggregation_mode));
            }
        }
    }
}

fn raw_contact_insert(state: &RawContactState) -> ProviderOp {
    let mut builder = ProviderOp::insert(Target::RawContacts)
        .value(rc::ACCOUNT_TYPE, state.account.account_type.as_str())
        .value(rc::ACCOUNT_NAME, state.account.account_name.as_str())
        .value(rc::AGGREGATION_MODE, AggregationMode::Suspended.code())
        .value(rc::NAME_VERIFIED, state.name_verified)
        .value(rc::IS_PROFILE, state.is_profile);
    if let Some(slot) = state.card_slot {
        builder = builder.value(rc::CARD_SLOT, slot_value(Some(slot)));
    }
    builder.build()
}

fn slot_value(slot: Option<CardSlot>) -> FieldValue {
    slot.map_or(FieldValue::Null, |slot| FieldValue::Integer(i64::from(slot.index())))
}

fn state_update(target: RawContactTarget, before: &RawContactState, after: &RawContactState) -> Option<ProviderOp> {
    let mut builder = target.select(ProviderOp::update(Target::RawContacts));
    let mut changed = false;
    if before.name_verified != after.name_verified {
        builder = builder.value(rc::NAME_VERIFIED, after.name_verified);
        changed = true;
    }
    if before.is_profile != after.is_profile {
        builder = builder.value(rc::IS_PROFILE, after.is_profile);
        changed = true;
    }
    if before.card_slot != after.card_slot {
        builder = builder.value(rc::CARD_SLOT, slot_value(after.card_slot));
        changed = true;
    }
    changed.then(|| builder.build())
}

fn push_data_op(ops: &mut Vec<ProviderOp>, target: RawContactTarget, entry: &DataDelta) {
    match entry.edit_kind() {
        EditKind::NoOp => {}
        EditKind::Insert => {
            let Some(row) = entry.after() else {
                return;
            };
            let mut builder = target
                .parent(ProviderOp::insert(Target::Data))
                .value(data_cols::MIMETYPE, row.kind.mimetype());
            for (column, value) in &row.values {
                if !value.is_null() {
                    builder = builder.value(column, value.clone());
                }
            }
            if row.is_primary {
                builder = builder.value(columns::IS_PRIMARY, true);
            }
            if row.is_super_primary {
                builder = builder.value(columns::IS_SUPER_PRIMARY, true);
            }
            ops.push(builder.build());
        }
        EditKind::Update => {
            let (Some(id), Some(before), Some(after)) = (entry.data_id(), entry.before(), entry.after()) else {
                return;
            };
            let mut builder = ProviderOp::update(Target::Data)
                .with_selection(data_cols::ID, id.get())
                .values(entry.changed_values());
            if before.is_primary != after.is_primary {
                builder = builder.value(columns::IS_PRIMARY, after.is_primary);
            }
            if before.is_super_primary != after.is_super_primary {
                builder = builder.value(columns::IS_SUPER_PRIMARY, after.is_super_primary);
            }
            ops.push(builder.build());
        }
        EditKind::Delete => {
            if let Some(id) = entry.data_id() {
                ops.push(
                    ProviderOp::delete(Target::Data)
                        .with_selection(data_cols::ID, id.get())
                        .build(),
                );
            }
        }
    }
}
