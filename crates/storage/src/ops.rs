use std::collections::BTreeMap;

use contactsave_core::{DataValues, FieldValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Update,
    Delete,
    /// Precondition: fails the whole batch when the matched row count or
    /// the matched rows' values differ from what the op expects.
    Assert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    RawContacts,
    Data,
    Groups,
    Contacts,
    AggregationExceptions,
}

impl Target {
    pub fn table(&self) -> &'static str {
        match self {
            Self::RawContacts => "raw_contacts",
            Self::Data => "data",
            Self::Groups => "groups",
            Self::Contacts => "contacts",
            Self::AggregationExceptions => "aggregation_exceptions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Value(FieldValue),
    /// Id inserted by the op at this position earlier in the same batch.
    BackRef(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub column: String,
    pub operand: Operand,
}

/// Conjunction of column equality tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub conditions: Vec<Condition>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.conditions.push(Condition {
            column: column.to_string(),
            operand: Operand::Value(value.into()),
        });
        self
    }

    pub fn eq_back_ref(mut self, column: &str, index: usize) -> Self {
        self.conditions.push(Condition {
            column: column.to_string(),
            operand: Operand::BackRef(index),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOp {
    pub kind: OpKind,
    pub target: Target,
    pub values: DataValues,
    /// Column -> position of an earlier insert whose id fills the column.
    pub back_refs: BTreeMap<String, usize>,
    pub selection: Selection,
    pub expected_count: Option<u64>,
}

impl ProviderOp {
    pub fn insert(target: Target) -> ProviderOpBuilder {
        ProviderOpBuilder::new(OpKind::Insert, target)
    }

    pub fn update(target: Target) -> ProviderOpBuilder {
        ProviderOpBuilder::new(OpKind::Update, target)
    }

    pub fn delete(target: Target) -> ProviderOpBuilder {
        ProviderOpBuilder::new(OpKind::Delete, target)
    }

    pub fn assert(target: Target) -> ProviderOpBuilder {
        ProviderOpBuilder::new(OpKind::Assert, target)
    }

    pub fn value(&self, column: &str) -> Option<&FieldValue> {
        self.values.get(column)
    }
}

#[derive(Debug)]
pub struct ProviderOpBuilder {
    op: ProviderOp,
}

impl ProviderOpBuilder {
    fn new(kind: OpKind, target: Target) -> Self {
        Self {
            op: ProviderOp {
                kind,
                target,
                values: DataValues::new(),
                back_refs: BTreeMap::new(),
                selection: Selection::new(),
                expected_count: None,
            },
        }
    }

    pub fn value(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.op.values.insert(column.to_string(), value.into());
        self
    }

    pub fn values(mut self, values: DataValues) -> Self {
        self.op.values.extend(values);
        self
    }

    pub fn back_reference(mut self, column: &str, index: usize) -> Self {
        self.op.back_refs.insert(column.to_string(), index);
        self
    }

    pub fn with_selection(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.op.selection = self.op.selection.eq(column, value);
        self
    }

    pub fn selection_back_reference(mut self, column: &str, index: usize) -> Self {
        self.op.selection = self.op.selection.eq_back_ref(column, index);
        self
    }

    pub fn selection(mut self, selection: Selection) -> Self {
        self.op.selection = selection;
        self
    }

    pub fn expected_count(mut self, count: u64) -> Self {
        self.op.expected_count = Some(count);
        self
    }

    pub fn build(self) -> ProviderOp {
        self.op
    }
}

/// Outcome of one op of an applied batch, in batch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpResult {
    pub inserted_id: Option<i64>,
    pub count: u64,
}

impl OpResult {
    pub fn inserted(id: i64) -> Self {
        Self {
            inserted_id: Some(id),
            count: 1,
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            inserted_id: None,
            count,
        }
    }
}
