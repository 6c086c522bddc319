//! Execution of SQL commands against one connection
//!
//! Reads of the same key arriving back to back are combined into a single
//! `SELECT`. Every other command runs in its own immediate transaction.

use crate::codec;
use crate::command::{
    FieldSelection, SqlCallback, SqlCommand, SqlReply, SqlRequest, WriteBackOp, WriteBackTask,
};
use crate::error::{SqlError, SqlResult};
use crate::meta::{DbMeta, TableMeta};
use rowkeep_common::{ErrorCode, Field, FieldValue, KEY_FIELD, VERSION_FIELD};
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use std::collections::HashMap;
use std::time::Instant;
use tracing::warn;

type Row = (i64, HashMap<String, FieldValue>);

/// Select `__version__` plus `columns` of one row
fn select_row(
    conn: &Connection,
    table: &TableMeta,
    key: &str,
    columns: &[&str],
    not_version: Option<i64>,
) -> SqlResult<Option<Row>> {
    let mut all_columns = Vec::with_capacity(columns.len() + 1);
    all_columns.push(VERSION_FIELD);
    all_columns.extend_from_slice(columns);

    let sql = codec::select_sql(table.name(), &all_columns, not_version.is_some());
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = match not_version {
        Some(v) => stmt.query(params![key, v])?,
        None => stmt.query(params![key])?,
    };
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let version: i64 = row.get(0)?;
    let mut values = HashMap::with_capacity(columns.len());
    for (i, name) in columns.iter().enumerate() {
        let Some(meta) = table.field(name) else {
            continue;
        };
        values.insert((*name).to_string(), codec::from_sql(meta, row.get_ref(i + 1)?)?);
    }
    Ok(Some((version, values)))
}

fn current_version(conn: &Connection, table: &TableMeta, key: &str) -> SqlResult<Option<i64>> {
    let sql = codec::select_sql(table.name(), &[VERSION_FIELD], false);
    let version = conn
        .query_row(&sql, params![key], |row| row.get(0))
        .optional()?;
    Ok(version)
}

/// Write a complete row, falling back to the column default for absent values
fn write_row(
    conn: &Connection,
    table: &TableMeta,
    key: &str,
    version: i64,
    values: &HashMap<String, FieldValue>,
    upsert: bool,
) -> SqlResult<()> {
    let mut columns = vec![KEY_FIELD, VERSION_FIELD];
    let mut params: Vec<Value> = vec![Value::Text(key.to_string()), Value::Integer(version)];
    for field in table.fields() {
        columns.push(field.name.as_str());
        params.push(codec::to_sql(values.get(&field.name).unwrap_or(&field.default)));
    }
    let sql = if upsert {
        codec::upsert_sql(table.name(), &columns)
    } else {
        codec::insert_sql(table.name(), &columns)
    };
    conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
    Ok(())
}

/// Update the version and the given columns, returning the matched row count
fn update_columns(
    conn: &Connection,
    table: &TableMeta,
    key: &str,
    version: i64,
    changes: &[(&str, &FieldValue)],
) -> SqlResult<usize> {
    let mut columns = vec![VERSION_FIELD];
    let mut params = vec![Value::Integer(version)];
    for &(name, value) in changes {
        if table.field(name).is_none() {
            continue;
        }
        columns.push(name);
        params.push(codec::to_sql(value));
    }
    params.push(Value::Text(key.to_string()));
    let sql = codec::update_sql(table.name(), &columns);
    let changed = conn.prepare_cached(&sql)?.execute(params_from_iter(params))?;
    Ok(changed)
}

fn version_gate(current: Option<i64>, expected: Option<i64>) -> Option<SqlReply> {
    let expected = expected?;
    let current = current.unwrap_or(0);
    (expected != current)
        .then(|| SqlReply::with_version(ErrorCode::VersionMismatch, current))
}

fn project(
    values: &HashMap<String, FieldValue>,
    selection: &FieldSelection,
) -> HashMap<String, FieldValue> {
    match selection {
        FieldSelection::All => values.clone(),
        FieldSelection::Fields(names) => names
            .iter()
            .filter_map(|n| values.get(n).map(|v| (n.clone(), v.clone())))
            .collect(),
    }
}

struct GetWaiter {
    selection: FieldSelection,
    version: Option<i64>,
    callback: SqlCallback,
}

enum GetOutcome {
    Found(Row),
    Unchanged(i64),
    NotFound,
}

/// One or more reads of the same record served by a single query
pub(crate) struct GetTask {
    table: String,
    key: String,
    uni_key: String,
    all: bool,
    fields: Vec<String>,
    /// Set only while every combined read carries the same version
    filter: Option<i64>,
    waiters: Vec<GetWaiter>,
}

impl GetTask {
    /// Start a task from a read, handing any other command back
    pub(crate) fn try_from_command(cmd: SqlCommand) -> Result<Self, SqlCommand> {
        let SqlCommand {
            table,
            key,
            uni_key,
            request,
            deadline,
            callback,
        } = cmd;
        match request {
            SqlRequest::Get { selection, version } => {
                let mut task = Self {
                    table,
                    key,
                    uni_key,
                    all: false,
                    fields: Vec::new(),
                    filter: version,
                    waiters: Vec::new(),
                };
                task.add(selection, version, callback);
                Ok(task)
            }
            request => Err(SqlCommand {
                table,
                key,
                uni_key,
                request,
                deadline,
                callback,
            }),
        }
    }

    /// Fold another read of the same key into this task
    ///
    /// Returns the command when it is not a read of this key.
    pub(crate) fn combine(&mut self, cmd: SqlCommand) -> Option<SqlCommand> {
        if cmd.uni_key != self.uni_key || !matches!(cmd.request, SqlRequest::Get { .. }) {
            return Some(cmd);
        }
        if let SqlRequest::Get { selection, version } = cmd.request {
            if self.filter != version {
                self.filter = None;
            }
            self.add(selection, version, cmd.callback);
        }
        None
    }

    fn add(&mut self, selection: FieldSelection, version: Option<i64>, callback: SqlCallback) {
        match &selection {
            FieldSelection::All => self.all = true,
            FieldSelection::Fields(names) => {
                for name in names {
                    if !self.fields.contains(name) {
                        self.fields.push(name.clone());
                    }
                }
            }
        }
        self.waiters.push(GetWaiter {
            selection,
            version,
            callback,
        });
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    fn load(&self, conn: &Connection, table: &TableMeta) -> SqlResult<GetOutcome> {
        let columns: Vec<&str> = if self.all {
            table.field_names().collect()
        } else {
            self.fields
                .iter()
                .map(String::as_str)
                .filter(|n| table.field(n).is_some())
                .collect()
        };

        if let Some(row) = select_row(conn, table, &self.key, &columns, self.filter)? {
            return Ok(GetOutcome::Found(row));
        }
        if self.filter.is_none() {
            return Ok(GetOutcome::NotFound);
        }
        // The filter hides an unchanged row; tell it apart from a missing one
        Ok(match current_version(conn, table, &self.key)? {
            Some(version) => GetOutcome::Unchanged(version),
            None => GetOutcome::NotFound,
        })
    }

    pub(crate) fn execute(self, conn: &Connection, meta: &DbMeta) {
        let Some(table) = meta.table(&self.table) else {
            for waiter in self.waiters {
                (waiter.callback)(SqlReply::code(ErrorCode::InvalidTable));
            }
            return;
        };

        match self.load(conn, &table) {
            Ok(GetOutcome::Found((version, values))) => {
                for waiter in self.waiters {
                    let reply = if waiter.version == Some(version) {
                        SqlReply::with_version(ErrorCode::RecordUnchange, version)
                    } else {
                        SqlReply::ok(version).with_fields(project(&values, &waiter.selection))
                    };
                    (waiter.callback)(reply);
                }
            }
            Ok(GetOutcome::Unchanged(version)) => {
                for waiter in self.waiters {
                    (waiter.callback)(SqlReply::with_version(ErrorCode::RecordUnchange, version));
                }
            }
            Ok(GetOutcome::NotFound) => {
                for waiter in self.waiters {
                    (waiter.callback)(SqlReply::code(ErrorCode::RecordNotExist));
                }
            }
            Err(e) => {
                warn!("SQL get of {} failed: {}", self.uni_key, e);
                for waiter in self.waiters {
                    (waiter.callback)(SqlReply::code(ErrorCode::SqlError));
                }
            }
        }
    }
}

fn set(
    conn: &mut Connection,
    table: &TableMeta,
    key: &str,
    fields: &[Field],
    expected: Option<i64>,
) -> SqlResult<SqlReply> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let current = current_version(&tx, table, key)?;
    if let Some(reply) = version_gate(current, expected) {
        return Ok(reply);
    }

    let version = if let Some(v) = current {
        let changes: Vec<(&str, &FieldValue)> =
            fields.iter().map(|f| (f.name.as_str(), &f.value)).collect();
        update_columns(&tx, table, key, v + 1, &changes)?;
        v + 1
    } else {
        let mut values = table.default_values();
        for field in fields {
            values.insert(field.name.clone(), field.value.clone());
        }
        write_row(&tx, table, key, 1, &values, false)?;
        1
    };
    tx.commit()?;
    Ok(SqlReply::ok(version))
}

/// Insert only when the row is absent
///
/// An existing row is returned with all of its columns.
fn set_nx(
    conn: &mut Connection,
    table: &TableMeta,
    key: &str,
    fields: &[Field],
) -> SqlResult<SqlReply> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let columns: Vec<&str> = table.field_names().collect();
    if let Some((version, values)) = select_row(&tx, table, key, &columns, None)? {
        tx.rollback()?;
        return Ok(SqlReply::with_version(ErrorCode::RecordExist, version).with_fields(values));
    }

    let mut values = table.default_values();
    for field in fields {
        values.insert(field.name.clone(), field.value.clone());
    }
    write_row(&tx, table, key, 1, &values, false)?;
    tx.commit()?;
    Ok(SqlReply::ok(1).with_fields(values))
}

fn incr_by(
    conn: &mut Connection,
    table: &TableMeta,
    key: &str,
    field: &str,
    delta: i64,
    expected: Option<i64>,
) -> SqlResult<SqlReply> {
    let Some(meta) = table.field(field) else {
        return Err(SqlError::schema(table.name(), format!("unknown field '{field}'")));
    };
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let row = select_row(&tx, table, key, &[field], None)?;
    if let Some(reply) = version_gate(row.as_ref().map(|(v, _)| *v), expected) {
        return Ok(reply);
    }

    let (version, value) = match row {
        Some((v, values)) => {
            let current = values.get(field).and_then(FieldValue::as_int).unwrap_or(0);
            let value = FieldValue::Int(current.wrapping_add(delta));
            update_columns(&tx, table, key, v + 1, &[(field, &value)])?;
            (v + 1, value)
        }
        None => {
            let base = meta.default.as_int().unwrap_or(0);
            let value = FieldValue::Int(base.wrapping_add(delta));
            let mut values = table.default_values();
            values.insert(field.to_string(), value.clone());
            write_row(&tx, table, key, 1, &values, false)?;
            (1, value)
        }
    };
    tx.commit()?;
    Ok(SqlReply::ok(version).with_fields(HashMap::from([(field.to_string(), value)])))
}

fn del(
    conn: &mut Connection,
    table: &TableMeta,
    key: &str,
    expected: Option<i64>,
) -> SqlResult<SqlReply> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let Some(current) = current_version(&tx, table, key)? else {
        return Ok(SqlReply::code(ErrorCode::RecordNotExist));
    };
    if let Some(reply) = version_gate(Some(current), expected) {
        return Ok(reply);
    }
    tx.execute(&codec::delete_sql(table.name()), params![key])?;
    tx.commit()?;
    Ok(SqlReply::ok(current + 1))
}

fn write_back(
    conn: &mut Connection,
    table: &TableMeta,
    key: &str,
    task: &WriteBackTask,
) -> SqlResult<SqlReply> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    match task.op {
        WriteBackOp::Delete => {
            tx.execute(&codec::delete_sql(table.name()), params![key])?;
        }
        WriteBackOp::Insert | WriteBackOp::Upsert => {
            write_row(&tx, table, key, task.version, &task.values, true)?;
        }
        WriteBackOp::Update => {
            let changes: Vec<(&str, &FieldValue)> = task
                .modified
                .iter()
                .filter_map(|n| task.values.get(n).map(|v| (n.as_str(), v)))
                .collect();
            if update_columns(&tx, table, key, task.version, &changes)? == 0 {
                write_row(&tx, table, key, task.version, &task.values, true)?;
            }
        }
    }
    tx.commit()?;
    Ok(SqlReply::ok(task.version))
}

/// Run one non-combined command and deliver its reply
pub(crate) fn execute_single(conn: &mut Connection, meta: &DbMeta, cmd: SqlCommand) {
    let cmd = match GetTask::try_from_command(cmd) {
        Ok(task) => {
            task.execute(conn, meta);
            return;
        }
        Err(cmd) => cmd,
    };

    let SqlCommand {
        table,
        key,
        uni_key,
        request,
        callback,
        ..
    } = cmd;
    let Some(table_meta) = meta.table(&table) else {
        callback(SqlReply::code(ErrorCode::InvalidTable));
        return;
    };

    let started = Instant::now();
    let result = match &request {
        SqlRequest::Get { .. } => Ok(SqlReply::code(ErrorCode::Other)),
        SqlRequest::Set { fields, version } => set(conn, &table_meta, &key, fields, *version),
        SqlRequest::SetNx { fields } => set_nx(conn, &table_meta, &key, fields),
        SqlRequest::IncrBy {
            field,
            delta,
            version,
        } => incr_by(conn, &table_meta, &key, field, *delta, *version),
        SqlRequest::DecrBy {
            field,
            delta,
            version,
        } => incr_by(conn, &table_meta, &key, field, delta.wrapping_neg(), *version),
        SqlRequest::Del { version } => del(conn, &table_meta, &key, *version),
        SqlRequest::WriteBack(task) => write_back(conn, &table_meta, &key, task),
    };

    let reply = result.unwrap_or_else(|e| {
        warn!(
            "SQL command on {} failed after {:?}: {}",
            uni_key,
            started.elapsed(),
            e
        );
        SqlReply::code(ErrorCode::SqlError)
    });
    callback(reply);
}
