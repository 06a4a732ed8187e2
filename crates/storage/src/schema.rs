use rusqlite::Connection;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
    ",
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at INTEGER NOT NULL
);
INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, unixepoch());

CREATE TABLE IF NOT EXISTS contacts (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    lookup_key TEXT NOT NULL UNIQUE,
    name_raw_contact_id INTEGER,
    display_name TEXT,
    starred INTEGER NOT NULL DEFAULT 0,
    send_to_voicemail INTEGER NOT NULL DEFAULT 0,
    custom_ringtone TEXT
);

CREATE TABLE IF NOT EXISTS raw_contacts (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_id INTEGER REFERENCES contacts(_id) ON DELETE SET NULL,
    account_type TEXT NOT NULL,
    account_name TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 1,
    aggregation_mode INTEGER NOT NULL DEFAULT 0,
    name_verified INTEGER NOT NULL DEFAULT 0,
    display_name_source INTEGER NOT NULL DEFAULT 0,
    is_profile INTEGER NOT NULL DEFAULT 0,
    card_slot INTEGER
);
CREATE INDEX IF NOT EXISTS idx_raw_contacts_contact ON raw_contacts (contact_id);
CREATE INDEX IF NOT EXISTS idx_raw_contacts_account ON raw_contacts (account_type, account_name);

CREATE TABLE IF NOT EXISTS data (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_contact_id INTEGER NOT NULL REFERENCES raw_contacts(_id) ON DELETE CASCADE,
    mimetype TEXT NOT NULL,
    is_primary INTEGER NOT NULL DEFAULT 0,
    is_super_primary INTEGER NOT NULL DEFAULT 0,
    data1, data2, data3, data4, data5, data6, data7, data8,
    data9, data10, data11, data12, data13, data14, data15
);
CREATE INDEX IF NOT EXISTS idx_data_raw_contact ON data (raw_contact_id, mimetype);

CREATE TABLE IF NOT EXISTS "groups" (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_type TEXT NOT NULL,
    account_name TEXT NOT NULL,
    title TEXT,
    source_id TEXT
);

CREATE TABLE IF NOT EXISTS aggregation_exceptions (
    _id INTEGER PRIMARY KEY AUTOINCREMENT,
    type INTEGER NOT NULL,
    raw_contact_id1 INTEGER NOT NULL REFERENCES raw_contacts(_id) ON DELETE CASCADE,
    raw_contact_id2 INTEGER NOT NULL REFERENCES raw_contacts(_id) ON DELETE CASCADE,
    UNIQUE (raw_contact_id1, raw_contact_id2)
);
"#;

/// Columns each target accepts in values and selections.
pub fn columns_for(table: &str) -> &'static [&'static str] {
    match table {
        "raw_contacts" => &[
            "_id",
            "contact_id",
            "account_type",
            "account_name",
            "version",
            "aggregation_mode",
            "name_verified",
            "display_name_source",
            "is_profile",
            "card_slot",
        ],
        "data" => &[
            "_id",
            "raw_contact_id",
            "mimetype",
            "is_primary",
            "is_super_primary",
            "data1",
            "data2",
            "data3",
            "data4",
            "data5",
            "data6",
            "data7",
            "data8",
            "data9",
            "data10",
            "data11",
            "data12",
            "data13",
            "data14",
            "data15",
        ],
        "groups" => &["_id", "account_type", "account_name", "title", "source_id"],
        "contacts" => &[
            "_id",
            "lookup_key",
            "name_raw_contact_id",
            "display_name",
            "starred",
            "send_to_voicemail",
            "custom_ringtone",
        ],
        "aggregation_exceptions" => &["_id", "type", "raw_contact_id1", "raw_contact_id2"],
        _ => &[],
    }
}

pub mod raw_contacts {
    pub const ID: &str = "_id";
    pub const CONTACT_ID: &str = "contact_id";
    pub const ACCOUNT_TYPE: &str = "account_type";
    pub const ACCOUNT_NAME: &str = "account_name";
    pub const VERSION: &str = "version";
    pub const AGGREGATION_MODE: &str = "aggregation_mode";
    pub const NAME_VERIFIED: &str = "name_verified";
    pub const IS_PROFILE: &str = "is_profile";
    pub const CARD_SLOT: &str = "card_slot";
}

pub mod data {
    pub const ID: &str = "_id";
    pub const RAW_CONTACT_ID: &str = "raw_contact_id";
    pub const MIMETYPE: &str = "mimetype";
}

pub mod groups {
    pub const ID: &str = "_id";
    pub const ACCOUNT_TYPE: &str = "account_type";
    pub const ACCOUNT_NAME: &str = "account_name";
    pub const TITLE: &str = "title";
    pub const SOURCE_ID: &str = "source_id";
}

pub mod contacts {
    pub const ID: &str = "_id";
    pub const STARRED: &str = "starred";
    pub const SEND_TO_VOICEMAIL: &str = "send_to_voicemail";
    pub const CUSTOM_RINGTONE: &str = "custom_ringtone";
}

pub mod exceptions {
    pub const TYPE: &str = "type";
    pub const RAW_CONTACT_ID1: &str = "raw_contact_id1";
    pub const RAW_CONTACT_ID2: &str = "raw_contact_id2";
}
