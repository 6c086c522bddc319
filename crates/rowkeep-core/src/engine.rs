//! Cache engine: shard routing, recovery and background tasks

use crate::binlog::{FileCounter, list_files, read_file};
use crate::command::{Command, CommandKind, Reply, Request};
use crate::record::RecordView;
use crate::shard::{Shard, ShardStats};
use parking_lot::Mutex;
use rowkeep_common::checksum::slot_of;
use rowkeep_common::{Error, ErrorCode, Field, FieldType, NodeConfig, Result, make_uni_key};
use rowkeep_sql::{DbMeta, FieldSelection, SqlPipeline, TableMeta, open_connection};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// State shared by every shard of a node
pub struct NodeContext {
    pub config: NodeConfig,
    pub meta: Arc<DbMeta>,
    pub sql: SqlPipeline,
    pub file_counter: Arc<FileCounter>,
}

/// Aggregated shard counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub shards: Vec<ShardStats>,
    pub total: ShardStats,
}

/// Outcome of binlog recovery
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub files: usize,
    pub entries: usize,
    pub write_backs: usize,
}

pub struct Engine {
    ctx: Arc<NodeContext>,
    shards: Vec<Arc<Shard>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    recovery: RecoveryStats,
    stopped: AtomicBool,
}

impl Engine {
    /// Open the SQL store, load table definitions, recover and start serving
    pub async fn open(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let meta = {
            let conn = open_connection(&config.sql)?;
            DbMeta::load(&conn)?
        };
        Self::open_with_meta(config, meta).await
    }

    /// Like [`Engine::open`] with table definitions supplied by the caller
    pub async fn open_with_meta(config: NodeConfig, meta: DbMeta) -> Result<Self> {
        config.validate()?;
        let meta = Arc::new(meta);
        let sql = SqlPipeline::start(&config.sql, Arc::clone(&meta))?;

        let files = list_files(config.binlog.dir(), &config.binlog.prefix)?;
        let last_index = files.last().map_or(0, |(index, _)| *index);
        let ctx = Arc::new(NodeContext {
            config,
            meta,
            sql,
            file_counter: Arc::new(FileCounter::new(last_index)),
        });

        let shards = (0..ctx.config.cache.shard_count)
            .map(|id| Shard::start(id, Arc::clone(&ctx)))
            .collect::<Result<Vec<_>>>()?;

        let mut engine = Self {
            ctx,
            shards,
            timers: Mutex::new(Vec::new()),
            recovery: RecoveryStats::default(),
            stopped: AtomicBool::new(false),
        };
        let files: Vec<PathBuf> = files.into_iter().map(|(_, path)| path).collect();
        engine.recovery = engine.recover(&files).await?;
        engine.start_timers();

        info!(
            "Engine started: {} shards, {} tables",
            engine.shards.len(),
            engine.ctx.meta.table_count()
        );
        Ok(engine)
    }

    fn shard_for(&self, uni_key: &str) -> &Arc<Shard> {
        &self.shards[slot_of(uni_key, self.shards.len())]
    }

    /// Replay binlog files, compact them into one snapshot per shard and
    /// queue the write-back the replayed records still owe
    async fn recover(&self, files: &[PathBuf]) -> Result<RecoveryStats> {
        if files.is_empty() {
            return Ok(RecoveryStats::default());
        }
        let started = Instant::now();
        let mut stats = RecoveryStats {
            files: files.len(),
            ..RecoveryStats::default()
        };

        for path in files {
            let read = read_file(path, |entry| {
                self.shard_for(&entry.uni_key).apply_replayed(entry)
            })?;
            debug!(
                "Replayed {}: {} blocks, {} entries",
                path.display(),
                read.blocks,
                read.entries
            );
            stats.entries += read.entries;
        }

        // The replayed files may only go once their content is durable again
        let barriers: Vec<oneshot::Receiver<()>> = self
            .shards
            .iter()
            .map(|shard| shard.write_startup_snapshot())
            .collect();
        for barrier in barriers {
            barrier
                .await
                .map_err(|_| Error::internal("flush worker exited during recovery"))?;
        }
        for path in files {
            fs::remove_file(path).map_err(|e| {
                Error::Storage(format!("failed to remove binlog {}: {}", path.display(), e))
            })?;
        }

        stats.write_backs = self
            .shards
            .iter()
            .map(Shard::schedule_pending_write_back)
            .sum();
        info!(
            "Recovered {} entries from {} binlog files in {:?}, {} write-backs scheduled",
            stats.entries,
            stats.files,
            started.elapsed(),
            stats.write_backs
        );
        Ok(stats)
    }

    fn start_timers(&self) {
        let flush_interval = self.ctx.config.binlog.flush_interval();
        let evict_interval = self.ctx.config.cache.evict_interval();
        let mut timers = self.timers.lock();
        for shard in &self.shards {
            timers.push(tokio::spawn(flush_loop(Arc::clone(shard), flush_interval)));
            timers.push(tokio::spawn(evict_loop(Arc::clone(shard), evict_interval)));
        }
    }

    /// Reject malformed commands before they reach a shard
    #[must_use]
    pub fn validate(&self, request: &Request) -> Option<ErrorCode> {
        if request.table.is_empty() {
            return Some(ErrorCode::MissingTable);
        }
        if request.key.is_empty() {
            return Some(ErrorCode::MissingKey);
        }
        let Some(table) = self.ctx.meta.table(&request.table) else {
            return Some(ErrorCode::InvalidTable);
        };
        validate_kind(&table, &request.kind).err()
    }

    /// Queue a command; the reply arrives on the returned receiver
    ///
    /// The receiver errors when the command expired before it was processed.
    pub fn submit(&self, request: Request) -> oneshot::Receiver<Reply> {
        let rejection = if self.stopped.load(Ordering::Acquire) {
            Some(ErrorCode::ServerStopped)
        } else {
            self.validate(&request)
        };
        let (cmd, rx) = Command::new(request);
        match rejection {
            Some(code) => cmd.reply(Reply::code(code)),
            None => self.shard_for(&cmd.uni_key).dispatch(cmd),
        }
        rx
    }

    /// Run a command and wait for its reply
    pub async fn execute(&self, request: Request) -> Reply {
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, self.submit(request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) | Err(_) => Reply::code(ErrorCode::Timeout),
        }
    }

    /// Re-read `table_conf`; on failure the current definitions stay
    pub fn reload_table_meta(&self) -> Result<()> {
        let conn = open_connection(&self.ctx.config.sql)?;
        self.ctx.meta.reload(&conn)?;
        Ok(())
    }

    /// Flush every shard and wait until the binlog is durable
    pub async fn flush(&self) -> Result<()> {
        let barriers: Vec<_> = self.shards.iter().map(|s| s.sync()).collect();
        for barrier in barriers {
            barrier.await.map_err(|_| Error::Stopped)?;
        }
        Ok(())
    }

    /// Run one eviction pass over every shard
    pub fn evict_now(&self) -> usize {
        self.shards.iter().map(Shard::kick_evictable).sum()
    }

    /// Whether some resident record has not reached the SQL store yet
    #[must_use]
    pub fn write_back_pending(&self) -> bool {
        self.shards.iter().any(|s| s.has_pending_write_back())
    }

    #[must_use]
    pub fn record_view(&self, table: &str, key: &str) -> Option<RecordView> {
        let uni_key = make_uni_key(table, key);
        self.shard_for(&uni_key).view(&uni_key)
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let shards: Vec<ShardStats> = self.shards.iter().map(|s| s.stats()).collect();
        let mut total = ShardStats::default();
        for s in &shards {
            total += *s;
        }
        EngineStats { shards, total }
    }

    #[must_use]
    pub const fn recovery(&self) -> RecoveryStats {
        self.recovery
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<DbMeta> {
        &self.ctx.meta
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.ctx.config
    }

    /// Stop timers, drain every shard, then stop the SQL workers
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
        for shard in &self.shards {
            shard.shutdown();
        }
        self.ctx.sql.shutdown();
        info!("Engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_fields(table: &TableMeta, fields: &[Field]) -> std::result::Result<(), ErrorCode> {
    if fields.is_empty() {
        return Err(ErrorCode::MissingFields);
    }
    let mut seen = HashSet::with_capacity(fields.len());
    for field in fields {
        if !table.check_field(field) || !seen.insert(field.name.as_str()) {
            return Err(ErrorCode::InvalidField);
        }
    }
    Ok(())
}

fn check_int_field(table: &TableMeta, name: &str) -> std::result::Result<(), ErrorCode> {
    match table.field(name) {
        Some(meta) if meta.field_type == FieldType::Int => Ok(()),
        _ => Err(ErrorCode::InvalidField),
    }
}

fn validate_kind(table: &TableMeta, kind: &CommandKind) -> std::result::Result<(), ErrorCode> {
    match kind {
        CommandKind::Get { selection, .. } => match selection {
            FieldSelection::All => Ok(()),
            FieldSelection::Fields(names) => {
                if names.iter().all(|n| table.field(n).is_some()) {
                    Ok(())
                } else {
                    Err(ErrorCode::InvalidField)
                }
            }
        },
        CommandKind::Set { fields, .. } | CommandKind::SetNx { fields } => {
            check_fields(table, fields)
        }
        CommandKind::CompareAndSet { field, old, new }
        | CommandKind::CompareAndSetNx { field, old, new } => {
            if field.is_empty() {
                return Err(ErrorCode::MissingFields);
            }
            let ty = table
                .field(field)
                .map(|meta| meta.field_type)
                .ok_or(ErrorCode::InvalidField)?;
            if old.field_type() == ty && new.field_type() == ty {
                Ok(())
            } else {
                Err(ErrorCode::InvalidField)
            }
        }
        CommandKind::IncrBy { field, .. } | CommandKind::DecrBy { field, .. } => {
            check_int_field(table, field)
        }
        CommandKind::Del { .. } => Ok(()),
    }
}

async fn flush_loop(shard: Arc<Shard>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        shard.flush();
    }
}

async fn evict_loop(shard: Arc<Shard>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let kicked = shard.kick_evictable();
        if kicked > 0 {
            debug!("Shard {} eviction pass kicked {} records", shard.id(), kicked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowkeep_common::FieldValue;

    fn table() -> TableMeta {
        TableMeta::parse("users", "name:string:,age:int:0,avatar:blob:").unwrap()
    }

    #[test]
    fn test_validate_fields() {
        let t = table();
        let set = |fields: Vec<Field>| CommandKind::Set {
            fields,
            version: None,
        };
        assert_eq!(validate_kind(&t, &set(vec![])), Err(ErrorCode::MissingFields));
        assert_eq!(
            validate_kind(&t, &set(vec![Field::new("nope", 1i64)])),
            Err(ErrorCode::InvalidField)
        );
        assert_eq!(
            validate_kind(&t, &set(vec![Field::new("age", "old")])),
            Err(ErrorCode::InvalidField)
        );
        assert_eq!(
            validate_kind(&t, &set(vec![Field::new("age", 1i64), Field::new("age", 2i64)])),
            Err(ErrorCode::InvalidField)
        );
        assert_eq!(validate_kind(&t, &set(vec![Field::new("age", 1i64)])), Ok(()));
    }

    #[test]
    fn test_validate_arith_and_cas() {
        let t = table();
        let incr = CommandKind::IncrBy {
            field: "name".to_string(),
            delta: 1,
            version: None,
        };
        assert_eq!(validate_kind(&t, &incr), Err(ErrorCode::InvalidField));

        let cas = CommandKind::CompareAndSet {
            field: "age".to_string(),
            old: FieldValue::Int(1),
            new: FieldValue::from("two"),
        };
        assert_eq!(validate_kind(&t, &cas), Err(ErrorCode::InvalidField));

        let cas = CommandKind::CompareAndSetNx {
            field: String::new(),
            old: FieldValue::Int(1),
            new: FieldValue::Int(2),
        };
        assert_eq!(validate_kind(&t, &cas), Err(ErrorCode::MissingFields));

        let get = CommandKind::Get {
            selection: FieldSelection::Fields(vec!["age".to_string(), "x".to_string()]),
            version: None,
        };
        assert_eq!(validate_kind(&t, &get), Err(ErrorCode::InvalidField));
        assert_eq!(validate_kind(&t, &CommandKind::Del { version: None }), Ok(()));
    }
}
