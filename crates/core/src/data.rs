use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;
use crate::ids::{DataId, GroupId};

/// Column name -> value for one data row. Keys are the generic `dataN`
/// columns; the per-kind aliases live in [`columns`].
pub type DataValues = BTreeMap<String, FieldValue>;

pub mod columns {
    pub const DISPLAY_NAME: &str = "data1";
    pub const GIVEN_NAME: &str = "data2";
    pub const FAMILY_NAME: &str = "data3";
    pub const PREFIX: &str = "data4";
    pub const MIDDLE_NAME: &str = "data5";
    pub const SUFFIX: &str = "data6";

    pub const NUMBER: &str = "data1";
    pub const PHONE_TYPE: &str = "data2";
    pub const PHONE_LABEL: &str = "data3";

    pub const ADDRESS: &str = "data1";
    pub const EMAIL_TYPE: &str = "data2";

    pub const GROUP_ROW_ID: &str = "data1";

    pub const PHOTO: &str = "data15";

    pub const IS_PRIMARY: &str = "is_primary";
    pub const IS_SUPER_PRIMARY: &str = "is_super_primary";

    /// Generic payload columns accepted from collaborators.
    pub const DATA_COLUMNS: [&str; 15] = [
        "data1", "data2", "data3", "data4", "data5", "data6", "data7", "data8", "data9",
        "data10", "data11", "data12", "data13", "data14", "data15",
    ];

    pub fn is_data_column(column: &str) -> bool {
        DATA_COLUMNS.contains(&column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataKind {
    StructuredName,
    Phone,
    Email,
    GroupMembership,
    Photo,
    Other(String),
}

impl DataKind {
    pub fn mimetype(&self) -> &str {
        match self {
            Self::StructuredName => "structured_name",
            Self::Phone => "phone",
            Self::Email => "email",
            Self::GroupMembership => "group_membership",
            Self::Photo => "photo",
            Self::Other(m) => m,
        }
    }

    pub fn from_mimetype(mimetype: &str) -> Self {
        match mimetype {
            "structured_name" => Self::StructuredName,
            "phone" => Self::Phone,
            "email" => Self::Email,
            "group_membership" => Self::GroupMembership,
            "photo" => Self::Photo,
            other => Self::Other(other.to_string()),
        }
    }

    /// Columns whose emptiness decides whether a row carries any content.
    /// Type and label columns never count on their own.
    pub fn content_columns(&self) -> &'static [&'static str] {
        use columns::*;
        match self {
            Self::StructuredName => &[
                DISPLAY_NAME,
                GIVEN_NAME,
                FAMILY_NAME,
                PREFIX,
                MIDDLE_NAME,
                SUFFIX,
            ],
            Self::Phone => &[NUMBER],
            Self::Email => &[ADDRESS],
            Self::GroupMembership => &[GROUP_ROW_ID],
            Self::Photo => &[PHOTO],
            Self::Other(_) => &DATA_COLUMNS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhoneType {
    Home,
    Mobile,
    Work,
    Other,
}

impl PhoneType {
    pub fn code(&self) -> i64 {
        match self {
            Self::Home => 1,
            Self::Mobile => 2,
            Self::Work => 3,
            Self::Other => 7,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Home,
            2 => Self::Mobile,
            3 => Self::Work,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmailType {
    Home,
    Work,
    Other,
    Mobile,
}

impl EmailType {
    pub fn code(&self) -> i64 {
        match self {
            Self::Home => 1,
            Self::Work => 2,
            Self::Other => 3,
            Self::Mobile => 4,
        }
    }
}

/// One typed field value attached to a raw contact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRow {
    pub id: Option<DataId>,
    pub kind: DataKind,
    pub values: DataValues,
    pub is_primary: bool,
    pub is_super_primary: bool,
}

impl DataRow {
    pub fn new(kind: DataKind) -> Self {
        Self {
            id: None,
            kind,
            values: DataValues::new(),
            is_primary: false,
            is_super_primary: false,
        }
    }

    pub fn with_id(mut self, id: DataId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.values.insert(column.to_string(), value.into());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn super_primary(mut self) -> Self {
        self.is_primary = true;
        self.is_super_primary = true;
        self
    }

    pub fn name(display_name: &str) -> Self {
        Self::new(DataKind::StructuredName).with(columns::DISPLAY_NAME, display_name)
    }

    pub fn phone(number: &str, phone_type: PhoneType) -> Self {
        Self::new(DataKind::Phone)
            .with(columns::NUMBER, number)
            .with(columns::PHONE_TYPE, phone_type.code())
    }

    pub fn email(address: &str, email_type: EmailType) -> Self {
        Self::new(DataKind::Email)
            .with(columns::ADDRESS, address)
            .with(columns::EMAIL_TYPE, email_type.code())
    }

    pub fn group_membership(group_id: GroupId) -> Self {
        Self::new(DataKind::GroupMembership).with(columns::GROUP_ROW_ID, group_id.get())
    }

    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.values.get(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.values.get(column).and_then(FieldValue::as_text)
    }

    pub fn phone_type(&self) -> Option<PhoneType> {
        self.values
            .get(columns::PHONE_TYPE)
            .and_then(FieldValue::as_integer)
            .map(PhoneType::from_code)
    }

    pub fn group_id(&self) -> Option<GroupId> {
        self.values
            .get(columns::GROUP_ROW_ID)
            .and_then(FieldValue::as_integer)
            .map(GroupId::new)
    }

    /// True when every content column of this row's kind is empty.
    pub fn is_empty(&self) -> bool {
        self.kind
            .content_columns()
            .iter()
            .all(|c| self.values.get(*c).is_none_or(FieldValue::is_empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_type_only_row_is_empty() {
        let row = DataRow::new(DataKind::Phone).with(columns::PHONE_TYPE, PhoneType::Mobile.code());
        assert!(row.is_empty());
        assert!(!DataRow::phone("5551234", PhoneType::Mobile).is_empty());
    }

    #[test]
    fn name_with_only_given_name_is_not_empty() {
        let row = DataRow::new(DataKind::StructuredName).with(columns::GIVEN_NAME, "Jane");
        assert!(!row.is_empty());
    }

    #[test]
    fn mimetype_roundtrip() {
        for kind in [
            DataKind::StructuredName,
            DataKind::Phone,
            DataKind::Email,
            DataKind::GroupMembership,
            DataKind::Photo,
            DataKind::Other("note".into()),
        ] {
            assert_eq!(DataKind::from_mimetype(kind.mimetype()), kind);
        }
    }
}
