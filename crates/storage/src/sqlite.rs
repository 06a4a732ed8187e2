use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::{debug, warn};

use contactsave_core::{
    Account, AggregationMode, CardSlot, ContactId, ContactRef, DataId, DataKind, DataRow,
    FieldValue, GroupId, RawContactId, RawContactSnapshot, RawContactState, columns,
};

use crate::aggregation::{self, BatchEffects, ExceptionType};
use crate::error::StorageError;
use crate::ops::{OpKind, OpResult, Operand, ProviderOp, Selection, Target};
use crate::schema;
use crate::traits::{ContactRecord, ContactStore, GroupRecord, RawContactInfo};

pub struct SqliteProvider {
    conn: Connection,
}

impl SqliteProvider {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

pub(crate) fn to_sql(value: &FieldValue) -> Value {
    match value {
        FieldValue::Null => Value::Null,
        FieldValue::Text(s) => Value::Text(s.clone()),
        FieldValue::Integer(n) => Value::Integer(*n),
        FieldValue::Bytes(b) => Value::Blob(b.clone()),
    }
}

pub(crate) fn from_sql(value: ValueRef<'_>) -> FieldValue {
    match value {
        ValueRef::Null => FieldValue::Null,
        ValueRef::Integer(n) => FieldValue::Integer(n),
        ValueRef::Real(f) => FieldValue::Text(f.to_string()),
        ValueRef::Text(t) => FieldValue::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => FieldValue::Bytes(b.to_vec()),
    }
}

fn table_sql(target: Target) -> String {
    format!("\"{}\"", target.table())
}

fn check_column(target: Target, column: &str) -> Result<(), StorageError> {
    if schema::columns_for(target.table()).contains(&column) {
        Ok(())
    } else {
        Err(StorageError::UnknownColumn {
            table: target.table(),
            column: column.to_string(),
        })
    }
}

fn back_ref(index: usize, reference: usize, results: &[OpResult]) -> Result<i64, StorageError> {
    if reference >= index {
        return Err(StorageError::BackReference { index, reference });
    }
    results
        .get(reference)
        .and_then(|r| r.inserted_id)
        .ok_or(StorageError::BackReference { index, reference })
}

/// Literal values and back references of an op, as bindable column values.
fn resolve_values(
    index: usize,
    op: &ProviderOp,
    results: &[OpResult],
) -> Result<Vec<(String, Value)>, StorageError> {
    let mut resolved = Vec::with_capacity(op.values.len() + op.back_refs.len());
    for (column, value) in &op.values {
        check_column(op.target, column)?;
        if op.back_refs.contains_key(column) {
            continue;
        }
        resolved.push((column.clone(), to_sql(value)));
    }
    for (column, reference) in &op.back_refs {
        check_column(op.target, column)?;
        resolved.push((column.clone(), Value::Integer(back_ref(index, *reference, results)?)));
    }
    Ok(resolved)
}

fn where_clause(
    index: usize,
    target: Target,
    selection: &Selection,
    results: &[OpResult],
) -> Result<(String, Vec<Value>), StorageError> {
    if selection.is_empty() {
        return Ok(("1".to_string(), Vec::new()));
    }
    let mut parts = Vec::with_capacity(selection.conditions.len());
    let mut bound = Vec::with_capacity(selection.conditions.len());
    for condition in &selection.conditions {
        check_column(target, &condition.column)?;
        match &condition.operand {
            Operand::Value(FieldValue::Null) => parts.push(format!("{} IS NULL", condition.column)),
            Operand::Value(value) => {
                parts.push(format!("{} = ?", condition.column));
                bound.push(to_sql(value));
            }
            Operand::BackRef(reference) => {
                parts.push(format!("{} = ?", condition.column));
                bound.push(Value::Integer(back_ref(index, *reference, results)?));
            }
        }
    }
    Ok((parts.join(" AND "), bound))
}

fn matching_ids(
    conn: &Connection,
    target: Target,
    where_sql: &str,
    bound: &[Value],
) -> Result<Vec<i64>, StorageError> {
    let sql = format!("SELECT _id FROM {} WHERE {where_sql} ORDER BY _id", table_sql(target));
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(bound.iter()), |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

fn owner_of(conn: &Connection, data_id: i64) -> Result<i64, StorageError> {
    Ok(conn.query_row(
        "SELECT raw_contact_id FROM data WHERE _id = ?1",
        params![data_id],
        |row| row.get(0),
    )?)
}

fn bump_version(conn: &Connection, raw_contact_id: i64) -> Result<(), StorageError> {
    conn.execute(
        "UPDATE raw_contacts SET version = version + 1 WHERE _id = ?1",
        params![raw_contact_id],
    )?;
    Ok(())
}

/// A super-primary or primary row clears the flag on its siblings of the
/// same kind.
fn enforce_primary(conn: &Connection, data_id: i64) -> Result<(), StorageError> {
    let (raw_contact_id, mimetype, is_primary, is_super_primary): (i64, String, bool, bool) = conn
        .query_row(
            "SELECT raw_contact_id, mimetype, is_primary, is_super_primary FROM data WHERE _id = ?1",
            params![data_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
    if is_super_primary {
        conn.execute(
            "UPDATE data SET is_super_primary = 0
             WHERE raw_contact_id = ?1 AND mimetype = ?2 AND _id != ?3",
            params![raw_contact_id, mimetype, data_id],
        )?;
        if !is_primary {
            conn.execute("UPDATE data SET is_primary = 1 WHERE _id = ?1", params![data_id])?;
        }
    }
    if is_primary || is_super_primary {
        conn.execute(
            "UPDATE data SET is_primary = 0
             WHERE raw_contact_id = ?1 AND mimetype = ?2 AND _id != ?3",
            params![raw_contact_id, mimetype, data_id],
        )?;
    }
    Ok(())
}

fn reject_managed_columns(
    index: usize,
    target: Target,
    values: &[(String, Value)],
) -> Result<(), StorageError> {
    let managed: &[&str] = match target {
        Target::RawContacts => &["_id", "version", "contact_id", "display_name_source"],
        Target::Contacts => &["_id", "lookup_key", "name_raw_contact_id", "display_name"],
        _ => &["_id"],
    };
    if let Some((column, _)) = values.iter().find(|(c, _)| managed.contains(&c.as_str())) {
        return Err(StorageError::InvalidOperation {
            index,
            reason: format!("{column} is maintained by the store"),
        });
    }
    Ok(())
}

fn integer_value(values: &[(String, Value)], column: &str) -> Option<i64> {
    values.iter().find(|(c, _)| c == column).and_then(|(_, v)| match v {
        Value::Integer(n) => Some(*n),
        _ => None,
    })
}

fn upsert_exception(
    conn: &Connection,
    index: usize,
    values: &[(String, Value)],
    effects: &mut BatchEffects,
) -> Result<OpResult, StorageError> {
    let (Some(kind), Some(id1), Some(id2)) = (
        integer_value(values, "type"),
        integer_value(values, "raw_contact_id1"),
        integer_value(values, "raw_contact_id2"),
    ) else {
        return Err(StorageError::InvalidOperation {
            index,
            reason: "aggregation exception needs type and both raw contact ids".into(),
        });
    };
    if id1 == id2 {
        return Err(StorageError::InvalidOperation {
            index,
            reason: format!("raw contact {id1} paired with itself"),
        });
    }
    conn.execute(
        "INSERT INTO aggregation_exceptions (type, raw_contact_id1, raw_contact_id2) VALUES (?1, ?2, ?3)
         ON CONFLICT(raw_contact_id1, raw_contact_id2) DO UPDATE SET type = excluded.type",
        params![kind, id1, id2],
    )?;
    if ExceptionType::from_code(kind) == Some(ExceptionType::KeepTogether) {
        aggregation::keep_together(conn, id1, id2, effects)?;
    }
    Ok(OpResult::affected(1))
}

fn apply_insert(
    conn: &Connection,
    index: usize,
    op: &ProviderOp,
    results: &[OpResult],
    effects: &mut BatchEffects,
) -> Result<OpResult, StorageError> {
    let values = resolve_values(index, op, results)?;
    match op.target {
        Target::Contacts => {
            return Err(StorageError::InvalidOperation {
                index,
                reason: "contacts are created by aggregation".into(),
            });
        }
        Target::AggregationExceptions => return upsert_exception(conn, index, &values, effects),
        _ => {}
    }
    reject_managed_columns(index, op.target, &values)?;

    let sql = if values.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table_sql(op.target))
    } else {
        let names: Vec<&str> = values.iter().map(|(c, _)| c.as_str()).collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            table_sql(op.target),
            names.join(", ")
        )
    };
    conn.execute(&sql, params_from_iter(values.iter().map(|(_, v)| v)))?;
    let id = conn.last_insert_rowid();

    match op.target {
        Target::RawContacts => {
            aggregation::attach_new_raw_contact(conn, id)?;
            effects.touch_raw_contact(conn, id)?;
        }
        Target::Data => {
            let owner = owner_of(conn, id)?;
            enforce_primary(conn, id)?;
            bump_version(conn, owner)?;
            effects.touch_raw_contact(conn, owner)?;
        }
        _ => {}
    }
    Ok(OpResult::inserted(id))
}

fn apply_update(
    conn: &Connection,
    index: usize,
    op: &ProviderOp,
    results: &[OpResult],
    effects: &mut BatchEffects,
) -> Result<OpResult, StorageError> {
    let values = resolve_values(index, op, results)?;
    if op.target == Target::AggregationExceptions {
        return upsert_exception(conn, index, &values, effects);
    }
    reject_managed_columns(index, op.target, &values)?;
    if values.is_empty() || op.selection.is_empty() {
        return Err(StorageError::InvalidOperation {
            index,
            reason: "update needs values and a selection".into(),
        });
    }

    let (where_sql, bound) = where_clause(index, op.target, &op.selection, results)?;
    let ids = matching_ids(conn, op.target, &where_sql, &bound)?;

    let mut assignments: Vec<String> = values.iter().map(|(c, _)| format!("{c} = ?")).collect();
    if op.target == Target::RawContacts {
        assignments.push("version = version + 1".into());
    }
    let sql = format!(
        "UPDATE {} SET {} WHERE _id = ?",
        table_sql(op.target),
        assignments.join(", ")
    );
    for id in &ids {
        let bound_row = values
            .iter()
            .map(|(_, v)| v.clone())
            .chain(std::iter::once(Value::Integer(*id)));
        conn.execute(&sql, params_from_iter(bound_row))?;
        match op.target {
            Target::RawContacts => effects.touch_raw_contact(conn, *id)?,
            Target::Data => {
                let owner = owner_of(conn, *id)?;
                enforce_primary(conn, *id)?;
                bump_version(conn, owner)?;
                effects.touch_raw_contact(conn, owner)?;
            }
            _ => {}
        }
    }
    Ok(OpResult::affected(ids.len() as u64))
}

fn apply_delete(
    conn: &Connection,
    index: usize,
    op: &ProviderOp,
    results: &[OpResult],
    effects: &mut BatchEffects,
) -> Result<OpResult, StorageError> {
    if op.selection.is_empty() {
        return Err(StorageError::InvalidOperation {
            index,
            reason: "delete needs a selection".into(),
        });
    }
    let (where_sql, bound) = where_clause(index, op.target, &op.selection, results)?;
    let ids = matching_ids(conn, op.target, &where_sql, &bound)?;

    for id in &ids {
        match op.target {
            Target::RawContacts => {
                if let Some(contact_id) = aggregation::contact_of(conn, *id)? {
                    effects.contacts.insert(contact_id);
                }
                conn.execute("DELETE FROM raw_contacts WHERE _id = ?1", params![id])?;
                effects.raw_contacts.remove(id);
            }
            Target::Data => {
                let owner = owner_of(conn, *id)?;
                conn.execute("DELETE FROM data WHERE _id = ?1", params![id])?;
                bump_version(conn, owner)?;
                effects.touch_raw_contact(conn, owner)?;
            }
            Target::Groups => {
                let mut stmt = conn.prepare(
                    "SELECT _id, raw_contact_id FROM data WHERE mimetype = ?1 AND data1 = ?2",
                )?;
                let memberships = stmt
                    .query_map(params![DataKind::GroupMembership.mimetype(), id], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                for (data_id, owner) in memberships {
                    conn.execute("DELETE FROM data WHERE _id = ?1", params![data_id])?;
                    bump_version(conn, owner)?;
                    effects.touch_raw_contact(conn, owner)?;
                }
                conn.execute("DELETE FROM \"groups\" WHERE _id = ?1", params![id])?;
            }
            Target::Contacts => {
                conn.execute("DELETE FROM raw_contacts WHERE contact_id = ?1", params![id])?;
                conn.execute("DELETE FROM contacts WHERE _id = ?1", params![id])?;
                effects.contacts.remove(id);
            }
            Target::AggregationExceptions => {
                conn.execute("DELETE FROM aggregation_exceptions WHERE _id = ?1", params![id])?;
            }
        }
    }
    Ok(OpResult::affected(ids.len() as u64))
}

fn apply_assert(
    conn: &Connection,
    index: usize,
    op: &ProviderOp,
    results: &[OpResult],
) -> Result<OpResult, StorageError> {
    let (where_sql, bound) = where_clause(index, op.target, &op.selection, results)?;
    let ids = matching_ids(conn, op.target, &where_sql, &bound)?;

    if let Some(expected) = op.expected_count {
        if ids.len() as u64 != expected {
            return Err(StorageError::AssertionFailed {
                index,
                reason: format!(
                    "expected {expected} rows in {}, found {}",
                    op.target.table(),
                    ids.len()
                ),
            });
        }
    }

    let values = resolve_values(index, op, results)?;
    for id in &ids {
        for (column, expected) in &values {
            let sql = format!("SELECT {column} FROM {} WHERE _id = ?1", table_sql(op.target));
            let actual: Value = conn.query_row(&sql, params![id], |row| row.get(0))?;
            if &actual != expected {
                return Err(StorageError::AssertionFailed {
                    index,
                    reason: format!("{column} of {} row {id} changed", op.target.table()),
                });
            }
        }
    }
    Ok(OpResult::affected(ids.len() as u64))
}

const RAW_CONTACT_COLUMNS: &str = "_id, contact_id, account_type, account_name, version, \
     aggregation_mode, name_verified, display_name_source, is_profile, card_slot";

struct RawContactRow {
    id: i64,
    contact_id: Option<i64>,
    account_type: String,
    account_name: String,
    version: i64,
    aggregation_mode: i64,
    name_verified: bool,
    display_name_source: i64,
    is_profile: bool,
    card_slot: Option<u32>,
}

impl RawContactRow {
    fn read(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            contact_id: row.get(1)?,
            account_type: row.get(2)?,
            account_name: row.get(3)?,
            version: row.get(4)?,
            aggregation_mode: row.get(5)?,
            name_verified: row.get(6)?,
            display_name_source: row.get(7)?,
            is_profile: row.get(8)?,
            card_slot: row.get(9)?,
        })
    }

    fn into_info(self) -> Result<RawContactInfo, StorageError> {
        Ok(RawContactInfo {
            id: RawContactId::new(self.id),
            contact_id: self.contact_id.map(ContactId::new),
            account: Account::new(self.account_type, self.account_name),
            version: self.version,
            aggregation_mode: AggregationMode::from_code(self.aggregation_mode)?,
            name_verified: self.name_verified,
            display_name_source: self.display_name_source,
            card_slot: self.card_slot.map(CardSlot::new),
        })
    }

    fn into_state(self) -> Result<RawContactState, StorageError> {
        let is_profile = self.is_profile;
        let info = self.into_info()?;
        Ok(RawContactState {
            id: Some(info.id),
            account: info.account,
            version: info.version,
            aggregation_mode: info.aggregation_mode,
            name_verified: info.name_verified,
            is_profile,
            card_slot: info.card_slot,
        })
    }
}

fn read_data_row(row: &rusqlite::Row) -> rusqlite::Result<DataRow> {
    let id: i64 = row.get(0)?;
    let mimetype: String = row.get(1)?;
    let mut data = DataRow::new(DataKind::from_mimetype(&mimetype)).with_id(DataId::new(id));
    data.is_primary = row.get(2)?;
    data.is_super_primary = row.get(3)?;
    for (offset, column) in columns::DATA_COLUMNS.iter().enumerate() {
        let value = from_sql(row.get_ref(4 + offset)?);
        if !value.is_null() {
            data.values.insert((*column).to_string(), value);
        }
    }
    Ok(data)
}

fn read_contact(row: &rusqlite::Row) -> rusqlite::Result<ContactRecord> {
    Ok(ContactRecord {
        id: ContactId::new(row.get(0)?),
        lookup_key: row.get(1)?,
        name_raw_contact_id: row.get::<_, Option<i64>>(2)?.map(RawContactId::new),
        display_name: row.get(3)?,
        starred: row.get(4)?,
        send_to_voicemail: row.get(5)?,
        custom_ringtone: row.get(6)?,
    })
}

fn read_group(row: &rusqlite::Row) -> rusqlite::Result<GroupRecord> {
    Ok(GroupRecord {
        id: GroupId::new(row.get(0)?),
        account: Account::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
        title: row.get(3)?,
        source_id: row.get(4)?,
    })
}

impl SqliteProvider {
    fn raw_contact_rows(&self, sql_where: &str, bound: &[Value]) -> Result<Vec<RawContactRow>, StorageError> {
        let sql = format!("SELECT {RAW_CONTACT_COLUMNS} FROM raw_contacts WHERE {sql_where} ORDER BY _id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(bound.iter()), RawContactRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn data_rows(&self, raw_contact_id: i64) -> Result<Vec<DataRow>, StorageError> {
        let sql = format!(
            "SELECT _id, mimetype, is_primary, is_super_primary, {} FROM data WHERE raw_contact_id = ?1 ORDER BY _id",
            columns::DATA_COLUMNS.join(", ")
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![raw_contact_id], read_data_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl ContactStore for SqliteProvider {
    fn apply_batch(&mut self, ops: &[ProviderOp]) -> Result<Vec<OpResult>, StorageError> {
        let tx = self.conn.transaction()?;
        let mut results = Vec::with_capacity(ops.len());
        let mut effects = BatchEffects::default();

        for (index, op) in ops.iter().enumerate() {
            let result = match op.kind {
                OpKind::Insert => apply_insert(&tx, index, op, &results, &mut effects),
                OpKind::Update => apply_update(&tx, index, op, &results, &mut effects),
                OpKind::Delete => apply_delete(&tx, index, op, &results, &mut effects),
                OpKind::Assert => apply_assert(&tx, index, op, &results),
            };
            match result {
                Ok(result) => results.push(result),
                Err(e) => {
                    warn!(index, error = %e, "batch rejected");
                    return Err(e);
                }
            }
        }

        aggregation::refresh(&tx, &effects)?;
        tx.commit()?;
        debug!(ops = ops.len(), "batch applied");
        Ok(results)
    }

    fn load_raw_contacts(&self, ids: &[RawContactId]) -> Result<Vec<RawContactSnapshot>, StorageError> {
        let mut snapshots = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(row) = self
                .raw_contact_rows("_id = ?", &[Value::Integer(id.get())])?
                .into_iter()
                .next()
            else {
                continue;
            };
            let data = self.data_rows(row.id)?;
            snapshots.push(RawContactSnapshot {
                state: row.into_state()?,
                data,
            });
        }
        Ok(snapshots)
    }

    fn raw_contact_info(&self, id: RawContactId) -> Result<Option<RawContactInfo>, StorageError> {
        self.raw_contact_rows("_id = ?", &[Value::Integer(id.get())])?
            .into_iter()
            .next()
            .map(RawContactRow::into_info)
            .transpose()
    }

    fn contact(&self, id: ContactId) -> Result<Option<ContactRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "SELECT _id, lookup_key, name_raw_contact_id, display_name, starred, send_to_voicemail, custom_ringtone
                 FROM contacts WHERE _id = ?1",
                params![id.get()],
                read_contact,
            )
            .optional()?;
        Ok(record)
    }

    fn contact_by_lookup_key(&self, lookup_key: &str) -> Result<Option<ContactRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "SELECT _id, lookup_key, name_raw_contact_id, display_name, starred, send_to_voicemail, custom_ringtone
                 FROM contacts WHERE lookup_key = ?1",
                params![lookup_key],
                read_contact,
            )
            .optional()?;
        Ok(record)
    }

    fn raw_contacts_for_contact(&self, id: ContactId) -> Result<Vec<RawContactInfo>, StorageError> {
        self.raw_contact_rows("contact_id = ?", &[Value::Integer(id.get())])?
            .into_iter()
            .map(RawContactRow::into_info)
            .collect()
    }

    fn raw_contacts_for_account(&self, account: &Account) -> Result<Vec<RawContactInfo>, StorageError> {
        self.raw_contact_rows(
            "account_type = ? AND account_name = ?",
            &[
                Value::Text(account.account_type.clone()),
                Value::Text(account.account_name.clone()),
            ],
        )?
        .into_iter()
        .map(RawContactRow::into_info)
        .collect()
    }

    fn raw_contact_for_card_slot(
        &self,
        account: &Account,
        slot: CardSlot,
    ) -> Result<Option<RawContactId>, StorageError> {
        let id: Option<i64> = self
            .conn
            .query_row(
                "SELECT _id FROM raw_contacts WHERE account_type = ?1 AND account_name = ?2 AND card_slot = ?3",
                params![account.account_type, account.account_name, slot.index()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(RawContactId::new))
    }

    fn profile_contact(&self) -> Result<Option<ContactRef>, StorageError> {
        let contact_id: Option<i64> = self
            .conn
            .query_row(
                "SELECT contact_id FROM raw_contacts WHERE is_profile = 1 AND contact_id IS NOT NULL ORDER BY _id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match contact_id {
            Some(id) => Ok(self.contact(ContactId::new(id))?.map(|c| c.contact_ref())),
            None => Ok(None),
        }
    }

    fn group(&self, id: GroupId) -> Result<Option<GroupRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "SELECT _id, account_type, account_name, title, source_id FROM \"groups\" WHERE _id = ?1",
                params![id.get()],
                read_group,
            )
            .optional()?;
        Ok(record)
    }

    fn groups_for_account(&self, account: &Account) -> Result<Vec<GroupRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT _id, account_type, account_name, title, source_id FROM \"groups\"
             WHERE account_type = ?1 AND account_name = ?2 ORDER BY _id",
        )?;
        let groups = stmt
            .query_map(params![account.account_type, account.account_name], read_group)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    fn group_ids_for_raw_contact(&self, id: RawContactId) -> Result<Vec<GroupId>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT data1 FROM data WHERE raw_contact_id = ?1 AND mimetype = ?2 ORDER BY _id",
        )?;
        let ids = stmt
            .query_map(params![id.get(), DataKind::GroupMembership.mimetype()], |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(GroupId::new).collect())
    }

    fn raw_contacts_in_group(&self, id: GroupId) -> Result<Vec<RawContactId>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT raw_contact_id FROM data WHERE mimetype = ?1 AND data1 = ?2 ORDER BY raw_contact_id",
        )?;
        let ids = stmt
            .query_map(params![DataKind::GroupMembership.mimetype(), id.get()], |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids.into_iter().map(RawContactId::new).collect())
    }

    fn count(&self, target: Target, selection: &Selection) -> Result<u64, StorageError> {
        let (where_sql, bound) = where_clause(0, target, selection, &[])?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE {where_sql}", table_sql(target));
        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(bound.iter()), |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl std::fmt::Debug for SqliteProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteProvider").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contactsave_core::{EmailType, PhoneType};

    fn insert_contact_ops(name: &str, number: &str) -> Vec<ProviderOp> {
        let account = Account::local();
        vec![
            ProviderOp::insert(Target::RawContacts)
                .value("account_type", account.account_type.as_str())
                .value("account_name", account.account_name.as_str())
                .build(),
            ProviderOp::insert(Target::Data)
                .back_reference("raw_contact_id", 0)
                .value("mimetype", DataKind::StructuredName.mimetype())
                .value(columns::DISPLAY_NAME, name)
                .build(),
            ProviderOp::insert(Target::Data)
                .back_reference("raw_contact_id", 0)
                .value("mimetype", DataKind::Phone.mimetype())
                .value(columns::NUMBER, number)
                .value(columns::PHONE_TYPE, PhoneType::Mobile.code())
                .build(),
        ]
    }

    fn seed(store: &mut SqliteProvider, name: &str) -> RawContactId {
        let results = store.apply_batch(&insert_contact_ops(name, "5551234")).unwrap();
        RawContactId::new(results[0].inserted_id.unwrap())
    }

    #[test]
    fn insert_with_back_references_creates_contact() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let id = seed(&mut store, "Jane");

        let snapshot = store.raw_contact(id).unwrap().unwrap();
        assert_eq!(snapshot.data.len(), 2);
        assert_eq!(snapshot.data[0].text(columns::DISPLAY_NAME), Some("Jane"));
        assert_eq!(snapshot.data[1].phone_type(), Some(PhoneType::Mobile));

        let contact = store.contact_ref_for_raw_contact(id).unwrap().unwrap();
        let record = store.contact(contact.contact_id).unwrap().unwrap();
        assert_eq!(record.display_name.as_deref(), Some("Jane"));
        assert_eq!(record.name_raw_contact_id, Some(id));
    }

    #[test]
    fn failed_assert_rolls_back_whole_batch() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let id = seed(&mut store, "Jane");
        let version = store.raw_contact(id).unwrap().unwrap().state.version;

        let ops = vec![
            ProviderOp::insert(Target::Data)
                .value("raw_contact_id", id.get())
                .value("mimetype", DataKind::Email.mimetype())
                .value(columns::ADDRESS, "jane@example.org")
                .build(),
            ProviderOp::assert(Target::RawContacts)
                .with_selection("_id", id.get())
                .value("version", version)
                .expected_count(1)
                .build(),
        ];
        let err = store.apply_batch(&ops).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.raw_contact(id).unwrap().unwrap().data.len(), 2);
    }

    #[test]
    fn data_mutations_bump_version() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let id = seed(&mut store, "Jane");
        let before = store.raw_contact(id).unwrap().unwrap();

        store
            .apply_batch(&[ProviderOp::insert(Target::Data)
                .value("raw_contact_id", id.get())
                .value("mimetype", DataKind::Email.mimetype())
                .value(columns::ADDRESS, "jane@example.org")
                .value(columns::EMAIL_TYPE, EmailType::Home.code())
                .build()])
            .unwrap();
        let after = store.raw_contact(id).unwrap().unwrap();
        assert!(after.state.version > before.state.version);
    }

    #[test]
    fn forward_back_reference_rejected() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let ops = vec![ProviderOp::insert(Target::Data)
            .back_reference("raw_contact_id", 0)
            .value("mimetype", DataKind::Email.mimetype())
            .build()];
        assert!(matches!(
            store.apply_batch(&ops),
            Err(StorageError::BackReference { index: 0, reference: 0 })
        ));
    }

    #[test]
    fn unknown_column_rejected() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let ops = vec![ProviderOp::insert(Target::Groups).value("bogus", 1).build()];
        assert!(matches!(
            store.apply_batch(&ops),
            Err(StorageError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn super_primary_is_exclusive() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let id = seed(&mut store, "Jane");
        for number in ["1", "2"] {
            store
                .apply_batch(&[ProviderOp::insert(Target::Data)
                    .value("raw_contact_id", id.get())
                    .value("mimetype", DataKind::Phone.mimetype())
                    .value(columns::NUMBER, number)
                    .value(columns::IS_SUPER_PRIMARY, 1)
                    .build()])
                .unwrap();
        }
        let snapshot = store.raw_contact(id).unwrap().unwrap();
        let flagged: Vec<_> = snapshot.data.iter().filter(|r| r.is_super_primary).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].text(columns::NUMBER), Some("2"));
        assert_eq!(snapshot.data.iter().filter(|r| r.is_primary).count(), 1);
    }

    #[test]
    fn keep_together_merges_and_last_delete_removes_contact() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let a = seed(&mut store, "Jane");
        let b = seed(&mut store, "J. Doe");
        store
            .apply_batch(&[ProviderOp::update(Target::AggregationExceptions)
                .value("type", ExceptionType::KeepTogether.code())
                .value("raw_contact_id1", a.get())
                .value("raw_contact_id2", b.get())
                .build()])
            .unwrap();

        let contact = store.contact_ref_for_raw_contact(a).unwrap().unwrap();
        assert_eq!(store.contact_ref_for_raw_contact(b).unwrap().unwrap(), contact);
        assert_eq!(store.count(Target::Contacts, &Selection::new()).unwrap(), 1);

        store
            .apply_batch(&[ProviderOp::delete(Target::Contacts)
                .with_selection("_id", contact.contact_id.get())
                .build()])
            .unwrap();
        assert_eq!(store.count(Target::RawContacts, &Selection::new()).unwrap(), 0);
        assert_eq!(store.count(Target::Contacts, &Selection::new()).unwrap(), 0);
    }

    #[test]
    fn deleting_group_drops_memberships() {
        let mut store = SqliteProvider::open_in_memory().unwrap();
        let id = seed(&mut store, "Jane");
        let results = store
            .apply_batch(&[ProviderOp::insert(Target::Groups)
                .value("account_type", "local")
                .value("account_name", "phone")
                .value("title", "Friends")
                .build()])
            .unwrap();
        let group = GroupId::new(results[0].inserted_id.unwrap());
        store
            .apply_batch(&[ProviderOp::insert(Target::Data)
                .value("raw_contact_id", id.get())
                .value("mimetype", DataKind::GroupMembership.mimetype())
                .value(columns::GROUP_ROW_ID, group.get())
                .build()])
            .unwrap();
        assert_eq!(store.group_ids_for_raw_contact(id).unwrap(), vec![group]);

        store
            .apply_batch(&[ProviderOp::delete(Target::Groups)
                .with_selection("_id", group.get())
                .build()])
            .unwrap();
        assert!(store.group_ids_for_raw_contact(id).unwrap().is_empty());
        assert!(store.group(group).unwrap().is_none());
    }

    #[test]
    fn on_disk_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contacts.db");
        let path = path.to_str().unwrap();
        let id = {
            let mut store = SqliteProvider::open(path).unwrap();
            seed(&mut store, "Jane")
        };
        let store = SqliteProvider::open(path).unwrap();
        assert!(store.raw_contact(id).unwrap().is_some());
    }
}
