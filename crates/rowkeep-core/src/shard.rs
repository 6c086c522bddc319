//! Cache shard
//!
//! A shard owns a hashed partition of the keyspace. All record state lives
//! behind one lock; binlog I/O happens on the shard's flush worker thread
//! and SQL work on the pipeline, both reporting back through callbacks.
//!
//! A mutation is answered only after the block carrying its binlog entry is
//! fsynced. Reads of a record with unflushed mutations wait behind them.

use crate::binlog::{BinlogBuffer, BinlogEntry, BinlogWriter, Opcode};
use crate::command::{Command, CommandKind, Reply, Replier};
use crate::engine::NodeContext;
use crate::lru::LruArena;
use crate::record::{Record, RecordStatus, RecordView, WriteBackFlag};
use bytes::Bytes;
use parking_lot::Mutex;
use rowkeep_common::{Error, ErrorCode, Field, FieldValue, Result, split_uni_key};
use rowkeep_sql::{FieldSelection, SqlCommand, SqlReply, SqlRequest, TableMeta, WriteBackTask};
use std::collections::HashMap;
use std::ops::AddAssign;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Counters of one shard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShardStats {
    pub records: usize,
    pub loading: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushed_blocks: u64,
}

impl AddAssign for ShardStats {
    fn add_assign(&mut self, other: Self) {
        self.records += other.records;
        self.loading += other.loading;
        self.hits += other.hits;
        self.misses += other.misses;
        self.evictions += other.evictions;
        self.flushed_blocks += other.flushed_blocks;
    }
}

/// A reply held until the block before it is durable
#[derive(Debug)]
struct ReplyContext {
    uni_key: String,
    replier: Replier,
    reply: Reply,
    /// The command changed the record
    mutated: bool,
}

#[derive(Debug)]
enum FlushJob {
    Block {
        payload: Bytes,
        entries: usize,
        contexts: Vec<ReplyContext>,
    },
    /// Start a new file; the current one is deleted by the next `Retire`
    Rotate,
    Retire,
    Barrier(oneshot::Sender<()>),
}

/// What the SQL store is asked when a record is first accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadKind {
    Get,
    SetNx,
}

/// A change computed against a record
#[derive(Debug)]
struct Mutation {
    flag: WriteBackFlag,
    /// New image; `None` deletes the record
    values: Option<HashMap<String, FieldValue>>,
    changed: Vec<String>,
    reply_fields: Vec<Field>,
}

#[derive(Debug)]
enum Outcome {
    Reply(Reply),
    Mutate(Mutation),
}

fn project(values: &HashMap<String, FieldValue>, selection: &FieldSelection) -> Vec<Field> {
    values
        .iter()
        .filter(|(name, _)| selection.contains(name))
        .map(|(name, value)| Field::new(name.as_str(), value.clone()))
        .collect()
}

fn all_fields(values: &HashMap<String, FieldValue>) -> Vec<Field> {
    project(values, &FieldSelection::All)
}

fn write_fields(
    current: Option<&HashMap<String, FieldValue>>,
    table: &TableMeta,
    changes: impl IntoIterator<Item = (String, FieldValue)>,
    reply_fields: Vec<Field>,
) -> Mutation {
    let (mut values, flag) = match current {
        Some(values) => (values.clone(), WriteBackFlag::Update),
        None => (table.default_values(), WriteBackFlag::Insert),
    };
    let mut changed = Vec::new();
    for (name, value) in changes {
        changed.push(name.clone());
        values.insert(name, value);
    }
    Mutation {
        flag,
        values: Some(values),
        changed,
        reply_fields,
    }
}

fn compare_and_set(
    values: &HashMap<String, FieldValue>,
    table: &TableMeta,
    version: i64,
    field: &str,
    old: &FieldValue,
    new: &FieldValue,
) -> Outcome {
    let current = values.get(field);
    if current != Some(old) {
        let fields = current
            .map(|v| vec![Field::new(field, v.clone())])
            .unwrap_or_default();
        return Outcome::Reply(
            Reply::with_version(ErrorCode::CasNotEqual, version).with_fields(fields),
        );
    }
    Outcome::Mutate(write_fields(
        Some(values),
        table,
        [(field.to_string(), new.clone())],
        vec![Field::new(field, new.clone())],
    ))
}

fn add(
    current: Option<&HashMap<String, FieldValue>>,
    table: &TableMeta,
    version: i64,
    field: &str,
    delta: i64,
    expected: Option<i64>,
) -> Outcome {
    if expected.is_some_and(|v| v != version) {
        return Outcome::Reply(Reply::with_version(ErrorCode::VersionMismatch, version));
    }
    // A missing record starts from the column default, as in the store
    let base = match current {
        Some(values) => values.get(field),
        None => table.field(field).map(|meta| &meta.default),
    };
    let base = match base {
        Some(FieldValue::Int(v)) => *v,
        Some(_) => return Outcome::Reply(Reply::code(ErrorCode::InvalidField)),
        None => 0,
    };
    let value = FieldValue::Int(base.wrapping_add(delta));
    Outcome::Mutate(write_fields(
        current,
        table,
        [(field.to_string(), value.clone())],
        vec![Field::new(field, value)],
    ))
}

/// Apply command semantics to a resident record
fn evaluate(record: &Record, table: &TableMeta, kind: &CommandKind) -> Outcome {
    let version = record.version;
    let current = record.values.as_ref();
    let gate = |expected: Option<i64>| {
        expected
            .filter(|&v| v != version)
            .map(|_| Outcome::Reply(Reply::with_version(ErrorCode::VersionMismatch, version)))
    };

    match kind {
        CommandKind::Get {
            selection,
            version: since,
        } => {
            let Some(values) = current else {
                return Outcome::Reply(Reply::with_version(ErrorCode::RecordNotExist, version));
            };
            if *since == Some(version) {
                return Outcome::Reply(Reply::with_version(ErrorCode::RecordUnchange, version));
            }
            Outcome::Reply(
                Reply::with_version(ErrorCode::Ok, version).with_fields(project(values, selection)),
            )
        }
        CommandKind::Set {
            fields,
            version: expected,
        } => gate(*expected).unwrap_or_else(|| {
            Outcome::Mutate(write_fields(
                current,
                table,
                fields.iter().map(|f| (f.name.clone(), f.value.clone())),
                Vec::new(),
            ))
        }),
        CommandKind::SetNx { fields } => match current {
            Some(values) => Outcome::Reply(
                Reply::with_version(ErrorCode::RecordExist, version)
                    .with_fields(all_fields(values)),
            ),
            None => Outcome::Mutate(write_fields(
                None,
                table,
                fields.iter().map(|f| (f.name.clone(), f.value.clone())),
                Vec::new(),
            )),
        },
        CommandKind::CompareAndSet { field, old, new } => match current {
            Some(values) => compare_and_set(values, table, version, field, old, new),
            None => Outcome::Reply(Reply::with_version(ErrorCode::RecordNotExist, version)),
        },
        CommandKind::CompareAndSetNx { field, old, new } => match current {
            Some(values) => compare_and_set(values, table, version, field, old, new),
            None => Outcome::Mutate(write_fields(
                None,
                table,
                [(field.clone(), new.clone())],
                vec![Field::new(field.as_str(), new.clone())],
            )),
        },
        CommandKind::IncrBy {
            field,
            delta,
            version: expected,
        } => add(current, table, version, field, *delta, *expected),
        CommandKind::DecrBy {
            field,
            delta,
            version: expected,
        } => add(current, table, version, field, delta.wrapping_neg(), *expected),
        CommandKind::Del { version: expected } => {
            if current.is_none() {
                return Outcome::Reply(Reply::with_version(ErrorCode::RecordNotExist, version));
            }
            gate(*expected).unwrap_or(Outcome::Mutate(Mutation {
                flag: WriteBackFlag::Delete,
                values: None,
                changed: Vec::new(),
                reply_fields: Vec::new(),
            }))
        }
    }
}

/// Append a full image of `record`; a missing record has no fields
fn append_image(buffer: &mut BinlogBuffer, record: &Record) {
    let fields = record
        .values
        .iter()
        .flatten()
        .map(|(name, value)| (name.as_str(), value));
    buffer.append(Opcode::Snapshot, &record.uni_key, record.version, fields);
}

struct ShardState {
    arena: LruArena<Record>,
    /// Resident records; exactly the linked arena slots
    records: HashMap<String, usize>,
    /// Placeholders waiting for the SQL store
    loading: HashMap<String, usize>,
    buffer: BinlogBuffer,
    contexts: Vec<ReplyContext>,
    flush_tx: Option<mpsc::UnboundedSender<FlushJob>>,
    snapshotting: bool,
    /// Records whose write-back failed
    retry: Vec<String>,
    /// Last version of deleted records that were evicted
    tombstones: HashMap<String, i64>,
    stopped: bool,
    stats: ShardStats,
}

impl ShardState {
    fn send(&self, job: FlushJob) {
        if let Some(tx) = &self.flush_tx
            && tx.send(job).is_err()
        {
            error!("Binlog flush worker has exited");
        }
    }

    /// Hand the buffered entries and replies to the flush worker
    fn flush(&mut self) {
        if self.buffer.is_empty() && self.contexts.is_empty() {
            return;
        }
        let (payload, entries) = self.buffer.take();
        let contexts = std::mem::take(&mut self.contexts);
        self.send(FlushJob::Block {
            payload,
            entries,
            contexts,
        });
    }

    fn flush_if_full(&mut self, flush_count: usize) {
        if self.buffer.count() >= flush_count {
            self.flush();
        }
    }

    /// Answer now, or after the pending mutations of the record are durable
    fn respond(&mut self, idx: usize, replier: Replier, reply: Reply) {
        match self.arena.get(idx) {
            Some(record) if record.unflushed > 0 => self.contexts.push(ReplyContext {
                uni_key: record.uni_key.clone(),
                replier,
                reply,
                mutated: false,
            }),
            _ => replier.send(reply),
        }
    }

    fn commit(&mut self, idx: usize, replier: Replier, mutation: Mutation) {
        let Some(record) = self.arena.get_mut(idx) else {
            return;
        };
        let flag = match record.write_back.merge(mutation.flag) {
            Ok(flag) => flag,
            Err(e) => {
                error!("Rejecting mutation of {}: {}", record.uni_key, e);
                replier.send(Reply::with_version(ErrorCode::Other, record.version));
                return;
            }
        };

        let version = record.version + 1;
        let was_ok = record.status == RecordStatus::Ok;
        match mutation.values {
            Some(values) => {
                if record.snapshotted && was_ok {
                    let changed = mutation
                        .changed
                        .iter()
                        .filter_map(|name| values.get_key_value(name.as_str()))
                        .map(|(name, value)| (name.as_str(), value));
                    self.buffer
                        .append(Opcode::Update, &record.uni_key, version, changed);
                } else {
                    let image = values.iter().map(|(name, value)| (name.as_str(), value));
                    self.buffer
                        .append(Opcode::Snapshot, &record.uni_key, version, image);
                }
                record.modified.extend(mutation.changed);
                record.set_ok(values, version);
            }
            None => {
                let opcode = if record.snapshotted {
                    Opcode::Delete
                } else {
                    Opcode::Snapshot
                };
                self.buffer
                    .append(opcode, &record.uni_key, version, std::iter::empty());
                record.modified.clear();
                record.set_missing(version);
            }
        }
        record.write_back = flag;
        record.snapshotted = true;
        record.unflushed += 1;

        self.contexts.push(ReplyContext {
            uni_key: record.uni_key.clone(),
            replier,
            reply: Reply::with_version(ErrorCode::Ok, version).with_fields(mutation.reply_fields),
            mutated: true,
        });
    }

    fn snapshot_batch(&mut self, keys: &[String]) {
        for uni_key in keys {
            let Some(&idx) = self.records.get(uni_key) else {
                continue;
            };
            let Some(record) = self.arena.get_mut(idx) else {
                continue;
            };
            if record.snapshotted {
                continue;
            }
            record.snapshotted = true;
            // A record that never existed has nothing to restore
            if record.version > 0 {
                append_image(&mut self.buffer, record);
            }
        }
    }

    fn mark_unsnapshotted(&mut self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.records.len());
        for (uni_key, &idx) in &self.records {
            if let Some(record) = self.arena.get_mut(idx) {
                record.snapshotted = false;
            }
            keys.push(uni_key.clone());
        }
        keys
    }

    /// Log every tombstone as a deleted image followed by its eviction
    fn append_tombstones(&mut self) {
        for (uni_key, &version) in &self.tombstones {
            self.buffer.append(Opcode::Snapshot, uni_key, version, std::iter::empty());
            self.buffer.append(Opcode::Kick, uni_key, version, std::iter::empty());
        }
    }

    fn record_mut(&mut self, uni_key: &str) -> Option<&mut Record> {
        let idx = *self.records.get(uni_key)?;
        self.arena.get_mut(idx)
    }
}

pub struct Shard {
    id: usize,
    ctx: Arc<NodeContext>,
    state: Mutex<ShardState>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shard {
    /// Create the shard and its flush worker
    pub(crate) fn start(id: usize, ctx: Arc<NodeContext>) -> Result<Arc<Self>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = BinlogWriter::new(ctx.config.binlog.clone(), Arc::clone(&ctx.file_counter));
        let shard = Arc::new(Self {
            id,
            ctx,
            state: Mutex::new(ShardState {
                arena: LruArena::new(),
                records: HashMap::new(),
                loading: HashMap::new(),
                buffer: BinlogBuffer::new(),
                contexts: Vec::new(),
                flush_tx: Some(tx),
                snapshotting: false,
                retry: Vec::new(),
                tombstones: HashMap::new(),
                stopped: false,
                stats: ShardStats::default(),
            }),
            flush_worker: Mutex::new(None),
        });

        let weak = Arc::downgrade(&shard);
        let handle = std::thread::Builder::new()
            .name(format!("rowkeep-binlog-{id}"))
            .spawn(move || run_flush_worker(&weak, writer, rx))
            .map_err(|e| Error::internal(format!("failed to spawn flush worker: {e}")))?;
        *shard.flush_worker.lock() = Some(handle);
        Ok(shard)
    }

    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    fn flush_count(&self) -> usize {
        self.ctx.config.binlog.flush_count
    }

    /// Route a validated command into this shard
    pub(crate) fn dispatch(self: &Arc<Self>, cmd: Command) {
        let load = {
            let mut state = self.state.lock();
            if state.stopped {
                drop(state);
                cmd.reply(Reply::code(ErrorCode::ServerStopped));
                return;
            }
            if cmd.is_expired(Instant::now()) {
                debug!("Dropping expired {} on {}", cmd.kind.name(), cmd.uni_key);
                return;
            }

            let mut load = None;
            if let Some(&idx) = state.records.get(&cmd.uni_key) {
                state.stats.hits += 1;
                state.arena.touch(idx);
                self.process(&mut state, idx, cmd);
            } else if let Some(&idx) = state.loading.get(&cmd.uni_key) {
                if let Some(record) = state.arena.get_mut(idx) {
                    record.waiting.push_back(cmd);
                }
            } else {
                state.stats.misses += 1;
                load = Some(self.start_load(&mut state, cmd));
            }
            state.flush_if_full(self.flush_count());
            load
        };

        // Submit outside the lock: a stopped pipeline answers synchronously
        if let Some(load) = load {
            self.ctx.sql.submit(load);
        }
    }

    fn start_load(self: &Arc<Self>, state: &mut ShardState, cmd: Command) -> SqlCommand {
        // The store has lost the version of a deleted record; decide SetNx here
        let deleted = state.tombstones.contains_key(&cmd.uni_key);
        let (request, kind) = match &cmd.kind {
            CommandKind::SetNx { fields } if !deleted => (
                SqlRequest::SetNx {
                    fields: fields.clone(),
                },
                LoadKind::SetNx,
            ),
            _ => (
                SqlRequest::Get {
                    selection: FieldSelection::All,
                    version: None,
                },
                LoadKind::Get,
            ),
        };

        let mut record = Record::loading(&cmd.table, &cmd.key, &cmd.uni_key);
        let (table, key, uni_key) = (cmd.table.clone(), cmd.key.clone(), cmd.uni_key.clone());
        record.waiting.push_back(cmd);
        let idx = state.arena.insert(record);
        state.loading.insert(uni_key.clone(), idx);

        let shard = Arc::downgrade(self);
        SqlCommand::new(table, key, request, move |reply| {
            if let Some(shard) = shard.upgrade() {
                shard.on_loaded(&uni_key, kind, reply);
            }
        })
    }

    fn on_loaded(self: &Arc<Self>, uni_key: &str, kind: LoadKind, reply: SqlReply) {
        let mut state = self.state.lock();
        let Some(idx) = state.loading.remove(uni_key) else {
            warn!("Load result for {} has no placeholder", uni_key);
            return;
        };
        let deleted_version = state.tombstones.get(uni_key).copied().unwrap_or(0);
        let Some(record) = state.arena.get_mut(idx) else {
            return;
        };
        let mut waiting = std::mem::take(&mut record.waiting);

        match (kind, reply.code) {
            (_, ErrorCode::Ok) | (LoadKind::SetNx, ErrorCode::RecordExist) => {
                record.set_ok(reply.fields.clone(), reply.version);
            }
            (LoadKind::Get, ErrorCode::RecordNotExist) => record.set_missing(deleted_version),
            (_, code) => {
                state.arena.remove(idx);
                drop(state);
                warn!("Failed to load {}: {}", uni_key, code);
                for cmd in waiting {
                    cmd.reply(Reply::code(code));
                }
                return;
            }
        }

        state.records.insert(uni_key.to_string(), idx);
        state.tombstones.remove(uni_key);
        state.arena.touch(idx);

        if kind == LoadKind::SetNx
            && let Some(cmd) = waiting.pop_front()
        {
            // The store already applied or refused it
            let mut answer = Reply::with_version(reply.code, reply.version);
            if reply.code == ErrorCode::RecordExist {
                answer = answer.with_fields(all_fields(&reply.fields));
            }
            cmd.reply(answer);
        }

        let now = Instant::now();
        for cmd in waiting {
            if cmd.is_expired(now) {
                debug!("Dropping expired {} on {}", cmd.kind.name(), cmd.uni_key);
                continue;
            }
            self.process(&mut state, idx, cmd);
        }
        state.flush_if_full(self.flush_count());
    }

    fn process(&self, state: &mut ShardState, idx: usize, cmd: Command) {
        let Some(record) = state.arena.get(idx) else {
            return;
        };
        let Some(table) = self.ctx.meta.table(&record.table) else {
            state.respond(idx, cmd.replier, Reply::code(ErrorCode::InvalidTable));
            return;
        };
        match evaluate(record, &table, &cmd.kind) {
            Outcome::Reply(reply) => state.respond(idx, cmd.replier, reply),
            Outcome::Mutate(mutation) => state.commit(idx, cmd.replier, mutation),
        }
    }

    /// Hand buffered entries to the flush worker
    pub(crate) fn flush(&self) {
        self.state.lock().flush();
    }

    /// Flush, then wait until everything queued so far is on disk
    pub(crate) fn sync(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.flush();
        state.send(FlushJob::Barrier(tx));
        rx
    }

    fn on_flushed(self: &Arc<Self>, contexts: Vec<ReplyContext>, written: bool) {
        let mut tasks = Vec::new();
        {
            let mut state = self.state.lock();
            if written {
                state.stats.flushed_blocks += 1;
            }
            for ctx in contexts {
                if ctx.mutated {
                    if let Some(record) = state.record_mut(&ctx.uni_key) {
                        record.unflushed = record.unflushed.saturating_sub(1);
                    }
                    if let Some(&idx) = state.records.get(&ctx.uni_key)
                        && let Some(task) = self.prepare_write_back(&mut state, idx)
                    {
                        tasks.push(task);
                    }
                }
                ctx.replier.send(ctx.reply);
            }
        }
        for task in tasks {
            self.ctx.sql.submit(task);
        }
    }

    /// Capture the pending write-back of a record and lock it
    fn prepare_write_back(
        self: &Arc<Self>,
        state: &mut ShardState,
        idx: usize,
    ) -> Option<SqlCommand> {
        let record = state.arena.get_mut(idx)?;
        if record.write_back_locked {
            return None;
        }
        let op = record.write_back.op()?;
        let flag = std::mem::take(&mut record.write_back);
        let modified: Vec<String> = record.modified.drain().collect();
        let task = WriteBackTask {
            op,
            version: record.version,
            values: record.values.clone().unwrap_or_default(),
            modified: modified.clone(),
        };
        record.write_back_locked = true;

        let shard = Arc::downgrade(self);
        let uni_key = record.uni_key.clone();
        Some(SqlCommand::new(
            record.table.as_str(),
            record.key.as_str(),
            SqlRequest::WriteBack(task),
            move |reply| {
                if let Some(shard) = shard.upgrade() {
                    shard.on_written_back(&uni_key, flag, modified, reply.code);
                }
            },
        ))
    }

    fn on_written_back(
        self: &Arc<Self>,
        uni_key: &str,
        flag: WriteBackFlag,
        modified: Vec<String>,
        code: ErrorCode,
    ) {
        let task = {
            let mut state = self.state.lock();
            let Some(&idx) = state.records.get(uni_key) else {
                warn!("Write-back result for {} has no record", uni_key);
                return;
            };
            let Some(record) = state.arena.get_mut(idx) else {
                return;
            };
            record.write_back_locked = false;

            if code.is_ok() {
                // Changes made while the task was in flight
                self.prepare_write_back(&mut state, idx)
            } else {
                warn!("Write-back of {} failed: {}", uni_key, code);
                let fallback = if record.status == RecordStatus::Ok {
                    WriteBackFlag::InsertUpdate
                } else {
                    WriteBackFlag::Delete
                };
                record.write_back = flag.merge(record.write_back).unwrap_or(fallback);
                record.modified.extend(modified);
                if code != ErrorCode::ServerStopped {
                    state.retry.push(uni_key.to_string());
                }
                None
            }
        };
        if let Some(task) = task {
            self.ctx.sql.submit(task);
        }
    }

    /// Evict least recently used records above the configured limit,
    /// stopping at the first one that is not kickable
    ///
    /// Also resubmits failed write-backs.
    pub(crate) fn kick_evictable(self: &Arc<Self>) -> usize {
        let mut tasks = Vec::new();
        let mut kicked = 0;
        {
            let mut state = self.state.lock();
            if state.stopped {
                return 0;
            }
            for uni_key in std::mem::take(&mut state.retry) {
                if let Some(&idx) = state.records.get(&uni_key)
                    && let Some(task) = self.prepare_write_back(&mut state, idx)
                {
                    tasks.push(task);
                }
            }

            let max = self.ctx.config.cache.max_records_per_shard;
            while state.records.len() > max {
                let Some(idx) = state.arena.tail() else {
                    break;
                };
                if !state.arena.get(idx).is_some_and(Record::is_kickable) {
                    break;
                }
                let Some(record) = state.arena.remove(idx) else {
                    break;
                };
                state.records.remove(&record.uni_key);
                if record.status == RecordStatus::Missing && record.version > 0 {
                    // Replay needs the deleted image in this file to restore the tombstone
                    if !record.snapshotted {
                        append_image(&mut state.buffer, &record);
                    }
                    state.tombstones.insert(record.uni_key.clone(), record.version);
                }
                state.buffer.append(
                    Opcode::Kick,
                    &record.uni_key,
                    record.version,
                    std::iter::empty(),
                );
                kicked += 1;
            }
            if kicked > 0 {
                state.stats.evictions += kicked as u64;
                debug!("Shard {} evicted {} records", self.id, kicked);
            }
            state.flush_if_full(self.flush_count());
        }
        for task in tasks {
            self.ctx.sql.submit(task);
        }
        kicked
    }

    /// Rewrite every resident record into a fresh binlog file
    ///
    /// Runs on the flush worker. Blocks queued before the rotation land in
    /// the old file; every record's first entry in the new file is a full
    /// image, so the old file can go once the last batch is durable.
    fn start_snapshot(&self) {
        let keys = {
            let mut state = self.state.lock();
            if state.snapshotting || state.stopped {
                return;
            }
            state.snapshotting = true;
            state.flush();
            state.send(FlushJob::Rotate);
            state.mark_unsnapshotted()
        };
        info!("Shard {} snapshot started: {} records", self.id, keys.len());

        let batch = self.ctx.config.binlog.snapshot_batch.max(1);
        for chunk in keys.chunks(batch) {
            let mut state = self.state.lock();
            state.snapshot_batch(chunk);
            state.flush();
        }
        let mut state = self.state.lock();
        state.append_tombstones();
        state.flush();
        state.send(FlushJob::Retire);
    }

    fn finish_snapshot(&self, removed: usize) {
        self.state.lock().snapshotting = false;
        info!(
            "Shard {} snapshot finished, removed {} binlog files",
            self.id, removed
        );
    }

    /// Apply one recovered binlog entry
    pub(crate) fn apply_replayed(&self, entry: BinlogEntry) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let existing = state.records.get(&entry.uni_key).copied();

        match entry.opcode {
            Opcode::Snapshot => {
                let idx = match existing {
                    Some(idx) => idx,
                    None => {
                        let (table, key) = split_uni_key(&entry.uni_key).ok_or_else(|| {
                            Error::corruption(format!("invalid key in binlog: {:?}", entry.uni_key))
                        })?;
                        let idx = state
                            .arena
                            .insert(Record::loading(table, key, &entry.uni_key));
                        state.records.insert(entry.uni_key.clone(), idx);
                        idx
                    }
                };
                state.arena.touch(idx);
                state.tombstones.remove(&entry.uni_key);
                let record = state
                    .arena
                    .get_mut(idx)
                    .ok_or_else(|| Error::internal("replayed record slot missing"))?;
                record.modified.clear();
                if entry.fields.is_empty() {
                    record.set_missing(entry.version);
                    record.write_back = WriteBackFlag::Delete;
                } else {
                    let values = entry
                        .fields
                        .into_iter()
                        .map(|f| (f.name, f.value))
                        .collect();
                    record.set_ok(values, entry.version);
                    record.write_back = WriteBackFlag::InsertUpdate;
                }
            }
            Opcode::Update => {
                let record = existing
                    .and_then(|idx| state.arena.get_mut(idx))
                    .filter(|r| r.status == RecordStatus::Ok)
                    .ok_or_else(|| {
                        Error::corruption(format!("update of absent record {}", entry.uni_key))
                    })?;
                let values = record.values.get_or_insert_with(HashMap::new);
                for field in entry.fields {
                    record.modified.insert(field.name.clone());
                    values.insert(field.name, field.value);
                }
                record.version = entry.version;
                record.write_back = WriteBackFlag::InsertUpdate;
            }
            Opcode::Delete => {
                let record = existing
                    .and_then(|idx| state.arena.get_mut(idx))
                    .ok_or_else(|| {
                        Error::corruption(format!("delete of absent record {}", entry.uni_key))
                    })?;
                record.modified.clear();
                record.set_missing(entry.version);
                record.write_back = WriteBackFlag::Delete;
            }
            Opcode::Kick => match existing {
                Some(idx) => {
                    state.records.remove(&entry.uni_key);
                    if let Some(record) = state.arena.remove(idx)
                        && record.status == RecordStatus::Missing
                        && record.version > 0
                    {
                        state.tombstones.insert(entry.uni_key, record.version);
                    }
                }
                None => warn!("Ignoring kick of absent record {}", entry.uni_key),
            },
        }
        Ok(())
    }

    /// Write a full image of every record into the current binlog file
    pub(crate) fn write_startup_snapshot(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        let keys = state.mark_unsnapshotted();
        state.snapshot_batch(&keys);
        state.append_tombstones();
        state.flush();
        state.send(FlushJob::Barrier(tx));
        rx
    }

    /// Submit write-back for every record that owes one
    pub(crate) fn schedule_pending_write_back(self: &Arc<Self>) -> usize {
        let tasks: Vec<SqlCommand> = {
            let mut state = self.state.lock();
            let slots: Vec<usize> = state.records.values().copied().collect();
            slots
                .into_iter()
                .filter_map(|idx| self.prepare_write_back(&mut state, idx))
                .collect()
        };
        let count = tasks.len();
        for task in tasks {
            self.ctx.sql.submit(task);
        }
        count
    }

    /// Whether any resident record still owes the store a write
    pub(crate) fn has_pending_write_back(&self) -> bool {
        let state = self.state.lock();
        state.records.values().any(|&idx| {
            state
                .arena
                .get(idx)
                .is_some_and(|r| r.write_back.is_pending() || r.write_back_locked)
        })
    }

    pub(crate) fn view(&self, uni_key: &str) -> Option<RecordView> {
        let state = self.state.lock();
        let idx = *state.records.get(uni_key)?;
        state.arena.get(idx).map(RecordView::from)
    }

    pub(crate) fn stats(&self) -> ShardStats {
        let state = self.state.lock();
        ShardStats {
            records: state.records.len(),
            loading: state.loading.len(),
            ..state.stats
        }
    }

    /// Flush what is buffered, stop accepting commands and wait for the
    /// flush worker to drain
    pub(crate) fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.flush();
            state.stopped = true;
            state.flush_tx = None;
        }
        if let Some(handle) = self.flush_worker.lock().take()
            && handle.join().is_err()
        {
            error!("Shard {} flush worker panicked", self.id);
        }
        debug!("Shard {} stopped", self.id);
    }
}

fn run_flush_worker(
    shard: &Weak<Shard>,
    mut writer: BinlogWriter,
    mut rx: mpsc::UnboundedReceiver<FlushJob>,
) {
    while let Some(job) = rx.blocking_recv() {
        match job {
            FlushJob::Block {
                payload,
                entries,
                contexts,
            } => {
                if entries > 0
                    && let Err(e) = writer.append_block(&payload, entries)
                {
                    error!("Binlog write failed: {}. Terminating", e);
                    std::process::exit(1);
                }
                let Some(shard) = shard.upgrade() else {
                    break;
                };
                shard.on_flushed(contexts, entries > 0);
                if writer.needs_snapshot() {
                    shard.start_snapshot();
                }
            }
            FlushJob::Rotate => writer.rotate(),
            FlushJob::Retire => {
                let removed = writer.remove_retired();
                if let Some(shard) = shard.upgrade() {
                    shard.finish_snapshot(removed);
                }
            }
            FlushJob::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}
