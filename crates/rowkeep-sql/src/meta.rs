//! Table metadata
//!
//! Table definitions live in the `table_conf` table of the store, one row per
//! table: `__table__` holds the name and `__conf__` a comma separated list of
//! `name:type:default` items. The parsed set is published through an
//! [`ArcSwap`] so readers never block a reload.

use crate::codec::quote_ident;
use crate::error::{SqlError, SqlResult};
use arc_swap::ArcSwap;
use rowkeep_common::{Field, FieldType, FieldValue, KEY_FIELD, VERSION_FIELD};
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Name of the table holding table definitions
pub const TABLE_CONF: &str = "table_conf";

/// A column of a configured table
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMeta {
    pub name: String,
    pub field_type: FieldType,
    pub default: FieldValue,
}

/// Raw table definition as stored in `table_conf`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub conf: String,
}

impl TableDef {
    pub fn new(name: impl Into<String>, conf: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conf: conf.into(),
        }
    }
}

/// Parsed table definition
#[derive(Debug)]
pub struct TableMeta {
    name: String,
    conf: String,
    fields: Vec<FieldMeta>,
    index: HashMap<String, usize>,
}

fn parse_default(ty: FieldType, s: &str) -> Option<FieldValue> {
    if s.is_empty() {
        return Some(FieldValue::zero(ty));
    }
    match ty {
        FieldType::Int => s.parse().ok().map(FieldValue::Int),
        FieldType::Float => s.parse().ok().map(FieldValue::Float),
        FieldType::String => Some(FieldValue::String(s.to_string())),
        FieldType::Blob => Some(FieldValue::Blob(s.as_bytes().to_vec())),
    }
}

impl TableMeta {
    /// Parse a `name:type:default,...` definition
    pub fn parse(name: &str, conf: &str) -> SqlResult<Self> {
        if name.is_empty() || name.contains(':') {
            return Err(SqlError::schema(name, "invalid table name"));
        }

        let mut fields: Vec<FieldMeta> = Vec::new();
        let mut index = HashMap::new();

        for (i, item) in conf.split(',').map(str::trim).enumerate() {
            if item.is_empty() {
                continue;
            }
            let parts: Vec<&str> = item.split(':').collect();
            let &[field_name, type_name, default] = parts.as_slice() else {
                return Err(SqlError::schema(
                    name,
                    format!("field {i} '{item}': expected name:type:default"),
                ));
            };

            if field_name.is_empty() {
                return Err(SqlError::schema(name, format!("field {i}: empty name")));
            }
            if field_name == KEY_FIELD || field_name == VERSION_FIELD {
                return Err(SqlError::schema(
                    name,
                    format!("field {i} '{field_name}': reserved name"),
                ));
            }
            if index.contains_key(field_name) {
                return Err(SqlError::schema(
                    name,
                    format!("field {i} '{field_name}': duplicated"),
                ));
            }
            let field_type = FieldType::parse(type_name).ok_or_else(|| {
                SqlError::schema(name, format!("field {i} '{item}': invalid type"))
            })?;
            let default = parse_default(field_type, default).ok_or_else(|| {
                SqlError::schema(name, format!("field {i} '{item}': invalid default value"))
            })?;

            index.insert(field_name.to_string(), fields.len());
            fields.push(FieldMeta {
                name: field_name.to_string(),
                field_type,
                default,
            });
        }

        if fields.is_empty() {
            return Err(SqlError::schema(name, "no fields"));
        }

        Ok(Self {
            name: name.to_string(),
            conf: conf.to_string(),
            fields,
            index,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The definition string this meta was parsed from
    #[must_use]
    pub fn conf(&self) -> &str {
        &self.conf
    }

    /// Columns in declaration order
    #[must_use]
    pub fn fields(&self) -> &[FieldMeta] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldMeta> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Every column set to its default
    #[must_use]
    pub fn default_values(&self) -> HashMap<String, FieldValue> {
        self.fields
            .iter()
            .map(|f| (f.name.clone(), f.default.clone()))
            .collect()
    }

    /// Whether the field exists and the value has the declared type
    #[must_use]
    pub fn check_field(&self, field: &Field) -> bool {
        self.field(&field.name)
            .is_some_and(|meta| meta.field_type == field.value.field_type())
    }

    /// Minimal DDL for the backing table
    #[must_use]
    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY NOT NULL, {} INTEGER NOT NULL",
            quote_ident(&self.name),
            quote_ident(KEY_FIELD),
            quote_ident(VERSION_FIELD),
        );
        for field in &self.fields {
            sql.push_str(", ");
            sql.push_str(&quote_ident(&field.name));
            sql.push(' ');
            sql.push_str(field.field_type.sql_type());
        }
        sql.push(')');
        sql
    }
}

fn build_metas(defs: &[TableDef]) -> SqlResult<HashMap<String, Arc<TableMeta>>> {
    let mut tables = HashMap::with_capacity(defs.len());
    for def in defs {
        let meta = TableMeta::parse(&def.name, &def.conf)?;
        tables.insert(def.name.clone(), Arc::new(meta));
    }
    Ok(tables)
}

/// The set of configured tables
pub struct DbMeta {
    tables: ArcSwap<HashMap<String, Arc<TableMeta>>>,
    version: AtomicU64,
}

impl DbMeta {
    pub fn new(tables: impl IntoIterator<Item = TableMeta>) -> Self {
        let tables: HashMap<String, Arc<TableMeta>> = tables
            .into_iter()
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        Self {
            tables: ArcSwap::from_pointee(tables),
            version: AtomicU64::new(1),
        }
    }

    pub fn from_defs(defs: &[TableDef]) -> SqlResult<Self> {
        Ok(Self {
            tables: ArcSwap::from_pointee(build_metas(defs)?),
            version: AtomicU64::new(1),
        })
    }

    /// Load every definition from `table_conf`
    pub fn load(conn: &Connection) -> SqlResult<Self> {
        let meta = Self::from_defs(&load_table_defs(conn)?)?;
        info!("Loaded {} table definitions", meta.table_count());
        Ok(meta)
    }

    /// Re-read `table_conf` and swap the table set
    ///
    /// The previous set stays active when any definition fails to parse.
    pub fn reload(&self, conn: &Connection) -> SqlResult<()> {
        let tables = build_metas(&load_table_defs(conn)?)?;
        let count = tables.len();
        self.tables.store(Arc::new(tables));
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        info!("Reloaded {} table definitions (meta version {})", count, version);
        Ok(())
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<Arc<TableMeta>> {
        self.tables.load().get(name).cloned()
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.load().len()
    }

    #[must_use]
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.load().keys().cloned().collect();
        names.sort();
        names
    }

    /// Incremented on every successful reload
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

fn ensure_conf_table(conn: &Connection) -> SqlResult<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_CONF} \
         (__table__ TEXT PRIMARY KEY NOT NULL, __conf__ TEXT NOT NULL)"
    ))?;
    Ok(())
}

/// Read the raw definitions, creating `table_conf` when absent
pub fn load_table_defs(conn: &Connection) -> SqlResult<Vec<TableDef>> {
    ensure_conf_table(conn)?;
    let mut stmt =
        conn.prepare(&format!("SELECT __table__, __conf__ FROM {TABLE_CONF} ORDER BY __table__"))?;
    let rows = stmt.query_map([], |row| {
        Ok(TableDef {
            name: row.get(0)?,
            conf: row.get(1)?,
        })
    })?;
    let defs = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(defs)
}

/// Register a table definition and create its backing table
pub fn install_table(conn: &Connection, meta: &TableMeta) -> SqlResult<()> {
    ensure_conf_table(conn)?;
    conn.execute(
        &format!(
            "INSERT INTO {TABLE_CONF} (__table__, __conf__) VALUES (?1, ?2) \
             ON CONFLICT(__table__) DO UPDATE SET __conf__ = excluded.__conf__"
        ),
        params![meta.name(), meta.conf()],
    )?;
    conn.execute_batch(&meta.create_table_sql())?;
    Ok(())
}
