//! Minimal contact aggregator.
//!
//! Every raw contact gets its own contact on insert. Contacts only merge
//! through keep-together exceptions. Display names are recomputed once per
//! batch for every contact the batch touched.

use std::collections::BTreeSet;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use contactsave_core::{AggregationMode, DataKind, columns};

use crate::error::StorageError;

pub mod display_name_source {
    pub const UNDEFINED: i64 = 0;
    pub const EMAIL: i64 = 10;
    pub const PHONE: i64 = 20;
    pub const STRUCTURED_NAME: i64 = 40;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionType {
    Automatic,
    KeepTogether,
    KeepSeparate,
}

impl ExceptionType {
    pub fn code(&self) -> i64 {
        match self {
            Self::Automatic => 0,
            Self::KeepTogether => 1,
            Self::KeepSeparate => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Automatic),
            1 => Some(Self::KeepTogether),
            2 => Some(Self::KeepSeparate),
            _ => None,
        }
    }
}

/// Raw contacts and contacts touched by one batch.
#[derive(Debug, Default)]
pub(crate) struct BatchEffects {
    pub raw_contacts: BTreeSet<i64>,
    pub contacts: BTreeSet<i64>,
}

impl BatchEffects {
    pub fn touch_raw_contact(&mut self, conn: &Connection, raw_contact_id: i64) -> Result<(), StorageError> {
        self.raw_contacts.insert(raw_contact_id);
        if let Some(contact_id) = contact_of(conn, raw_contact_id)? {
            self.contacts.insert(contact_id);
        }
        Ok(())
    }
}

pub(crate) fn lookup_key(account_type: &str, account_name: &str, raw_contact_id: i64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(account_type.as_bytes());
    hasher.update(b"/");
    hasher.update(account_name.as_bytes());
    hasher.update(b"/");
    hasher.update(&raw_contact_id.to_le_bytes());
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

pub(crate) fn contact_of(conn: &Connection, raw_contact_id: i64) -> Result<Option<i64>, StorageError> {
    let contact_id: Option<Option<i64>> = conn
        .query_row(
            "SELECT contact_id FROM raw_contacts WHERE _id = ?1",
            params![raw_contact_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(contact_id.flatten())
}

/// Creates the contact owning a freshly inserted raw contact.
pub(crate) fn attach_new_raw_contact(conn: &Connection, raw_contact_id: i64) -> Result<i64, StorageError> {
    let (account_type, account_name): (String, String) = conn.query_row(
        "SELECT account_type, account_name FROM raw_contacts WHERE _id = ?1",
        params![raw_contact_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let key = lookup_key(&account_type, &account_name, raw_contact_id);
    conn.execute(
        "INSERT INTO contacts (lookup_key, name_raw_contact_id) VALUES (?1, ?2)",
        params![key, raw_contact_id],
    )?;
    let contact_id = conn.last_insert_rowid();
    conn.execute(
        "UPDATE raw_contacts SET contact_id = ?1 WHERE _id = ?2",
        params![contact_id, raw_contact_id],
    )?;
    debug!(raw_contact_id, contact_id, "contact created");
    Ok(contact_id)
}

/// Moves every raw contact of the second raw contact's contact into the
/// first one's contact. Returns the surviving contact id.
pub(crate) fn keep_together(
    conn: &Connection,
    raw_contact_id1: i64,
    raw_contact_id2: i64,
    effects: &mut BatchEffects,
) -> Result<Option<i64>, StorageError> {
    let (Some(keep), Some(absorb)) = (contact_of(conn, raw_contact_id1)?, contact_of(conn, raw_contact_id2)?) else {
        return Ok(None);
    };
    if keep == absorb {
        return Ok(Some(keep));
    }
    conn.execute(
        "UPDATE raw_contacts SET contact_id = ?1 WHERE contact_id = ?2",
        params![keep, absorb],
    )?;
    conn.execute(
        "UPDATE contacts SET
            starred = max(starred, (SELECT starred FROM contacts WHERE _id = ?2)),
            send_to_voicemail = min(send_to_voicemail, (SELECT send_to_voicemail FROM contacts WHERE _id = ?2)),
            custom_ringtone = coalesce(custom_ringtone, (SELECT custom_ringtone FROM contacts WHERE _id = ?2))
         WHERE _id = ?1",
        params![keep, absorb],
    )?;
    conn.execute("DELETE FROM contacts WHERE _id = ?1", params![absorb])?;
    effects.contacts.remove(&absorb);
    effects.contacts.insert(keep);
    debug!(keep, absorb, "contacts merged");
    Ok(Some(keep))
}

struct Candidate {
    raw_contact_id: i64,
    aggregation_mode: i64,
    name_verified: bool,
    source: i64,
    name: Option<String>,
}

fn first_text(conn: &Connection, raw_contact_id: i64, kind: &DataKind, column: &str) -> Result<Option<String>, StorageError> {
    let sql = format!(
        "SELECT CAST({column} AS TEXT) FROM data WHERE raw_contact_id = ?1 AND mimetype = ?2
         AND {column} IS NOT NULL AND trim({column}) != ''
         ORDER BY is_super_primary DESC, is_primary DESC, _id LIMIT 1"
    );
    let value: Option<String> = conn
        .query_row(&sql, params![raw_contact_id, kind.mimetype()], |row| row.get(0))
        .optional()?;
    Ok(value)
}

fn structured_name(conn: &Connection, raw_contact_id: i64) -> Result<Option<String>, StorageError> {
    if let Some(display) = first_text(conn, raw_contact_id, &DataKind::StructuredName, columns::DISPLAY_NAME)? {
        return Ok(Some(display));
    }
    let given = first_text(conn, raw_contact_id, &DataKind::StructuredName, columns::GIVEN_NAME)?;
    let family = first_text(conn, raw_contact_id, &DataKind::StructuredName, columns::FAMILY_NAME)?;
    Ok(match (given, family) {
        (Some(g), Some(f)) => Some(format!("{g} {f}")),
        (g, f) => g.or(f),
    })
}

fn best_name(conn: &Connection, raw_contact_id: i64) -> Result<(i64, Option<String>), StorageError> {
    if let Some(name) = structured_name(conn, raw_contact_id)? {
        return Ok((display_name_source::STRUCTURED_NAME, Some(name)));
    }
    if let Some(number) = first_text(conn, raw_contact_id, &DataKind::Phone, columns::NUMBER)? {
        return Ok((display_name_source::PHONE, Some(number)));
    }
    if let Some(address) = first_text(conn, raw_contact_id, &DataKind::Email, columns::ADDRESS)? {
        return Ok((display_name_source::EMAIL, Some(address)));
    }
    Ok((display_name_source::UNDEFINED, None))
}

/// Recomputes name sources and display names for the touched contacts and
/// deletes contacts left without raw contacts.
pub(crate) fn refresh(conn: &Connection, effects: &BatchEffects) -> Result<(), StorageError> {
    let mut contacts = effects.contacts.clone();
    for raw_contact_id in &effects.raw_contacts {
        if let Some(contact_id) = contact_of(conn, *raw_contact_id)? {
            contacts.insert(contact_id);
        }
    }

    for contact_id in contacts {
        let mut stmt = conn.prepare(
            "SELECT _id, aggregation_mode, name_verified FROM raw_contacts WHERE contact_id = ?1 ORDER BY _id",
        )?;
        let members = stmt
            .query_map(params![contact_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, bool>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if members.is_empty() {
            conn.execute("DELETE FROM contacts WHERE _id = ?1", params![contact_id])?;
            debug!(contact_id, "contact removed with its last raw contact");
            continue;
        }

        let mut candidates = Vec::with_capacity(members.len());
        for (raw_contact_id, aggregation_mode, name_verified) in members {
            let (source, name) = best_name(conn, raw_contact_id)?;
            conn.execute(
                "UPDATE raw_contacts SET display_name_source = ?1 WHERE _id = ?2",
                params![source, raw_contact_id],
            )?;
            candidates.push(Candidate {
                raw_contact_id,
                aggregation_mode,
                name_verified,
                source,
                name,
            });
        }

        let suspended = AggregationMode::Suspended.code();
        let eligible: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.aggregation_mode != suspended)
            .collect();
        if eligible.is_empty() {
            continue;
        }
        let winner = eligible
            .iter()
            .find(|c| c.name_verified && c.source > display_name_source::UNDEFINED)
            .or_else(|| {
                eligible
                    .iter()
                    .max_by(|a, b| a.source.cmp(&b.source).then(b.raw_contact_id.cmp(&a.raw_contact_id)))
            });
        if let Some(winner) = winner {
            conn.execute(
                "UPDATE contacts SET display_name = ?1, name_raw_contact_id = ?2 WHERE _id = ?3",
                params![winner.name, winner.raw_contact_id, contact_id],
            )?;
        }
    }
    Ok(())
}
