//! SQL worker pipeline
//!
//! A fixed set of worker threads, each owning one connection. Commands are
//! routed by the hash of their `table:key`, so every command on a record
//! executes in submission order on the same worker.

use crate::command::{SqlCommand, SqlReply};
use crate::error::SqlResult;
use crate::meta::DbMeta;
use crate::task::{self, GetTask};
use parking_lot::{Mutex, RwLock};
use rowkeep_common::ErrorCode;
use rowkeep_common::checksum::slot_of;
use rowkeep_common::config::SqlConfig;
use rusqlite::Connection;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Open a connection configured for the pipeline
pub fn open_connection(config: &SqlConfig) -> SqlResult<Connection> {
    let conn = Connection::open(&config.path)?;
    conn.busy_timeout(config.busy_timeout())?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}

pub struct SqlPipeline {
    senders: RwLock<Vec<mpsc::UnboundedSender<SqlCommand>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SqlPipeline {
    /// Open one connection per worker and start the workers
    pub fn start(config: &SqlConfig, meta: Arc<DbMeta>) -> SqlResult<Self> {
        let count = config.connections.max(1);
        let batch_size = config.batch_size.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);

        for id in 0..count {
            let conn = open_connection(config)?;
            let (tx, rx) = mpsc::unbounded_channel();
            let worker = Worker {
                id,
                conn,
                meta: Arc::clone(&meta),
                rx,
                batch_size,
            };
            let handle = std::thread::Builder::new()
                .name(format!("rowkeep-sql-{id}"))
                .spawn(move || worker.run())?;
            senders.push(tx);
            workers.push(handle);
        }

        info!(
            "SQL pipeline started: {} workers on {}",
            count,
            config.path.display()
        );

        Ok(Self {
            senders: RwLock::new(senders),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a command on the worker owning its key
    ///
    /// After shutdown the command is answered with `SERVER_STOPPED` on the
    /// calling thread.
    pub fn submit(&self, cmd: SqlCommand) {
        let rejected = {
            let senders = self.senders.read();
            if senders.is_empty() {
                Some(cmd)
            } else {
                let slot = slot_of(cmd.uni_key(), senders.len());
                senders[slot].send(cmd).err().map(|e| e.0)
            }
        };
        if let Some(cmd) = rejected {
            debug!("SQL pipeline stopped, rejecting {}", cmd.uni_key());
            cmd.reply(SqlReply::code(ErrorCode::ServerStopped));
        }
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.senders.read().len()
    }

    /// Stop accepting commands and wait for queued ones to finish
    pub fn shutdown(&self) {
        let senders = std::mem::take(&mut *self.senders.write());
        if senders.is_empty() {
            return;
        }
        drop(senders);

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = std::thread::current().id();
        for handle in workers {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("SQL worker panicked during shutdown");
            }
        }
        info!("SQL pipeline stopped");
    }
}

impl Drop for SqlPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    id: usize,
    conn: Connection,
    meta: Arc<DbMeta>,
    rx: mpsc::UnboundedReceiver<SqlCommand>,
    batch_size: usize,
}

impl Worker {
    fn run(mut self) {
        debug!("SQL worker {} started", self.id);
        let mut batch = Vec::with_capacity(self.batch_size);
        while let Some(cmd) = self.rx.blocking_recv() {
            batch.push(cmd);
            while batch.len() < self.batch_size {
                match self.rx.try_recv() {
                    Ok(cmd) => batch.push(cmd),
                    Err(_) => break,
                }
            }
            self.process(&mut batch);
        }
        debug!("SQL worker {} stopped", self.id);
    }

    fn process(&mut self, batch: &mut Vec<SqlCommand>) {
        let now = Instant::now();
        let mut pending: Option<GetTask> = None;

        for cmd in batch.drain(..) {
            if cmd.is_expired(now) {
                debug!("Dropping expired SQL command for {}", cmd.uni_key());
                continue;
            }
            let cmd = match pending.as_mut() {
                Some(get) => match get.combine(cmd) {
                    None => continue,
                    Some(cmd) => cmd,
                },
                None => cmd,
            };
            if let Some(get) = pending.take() {
                get.execute(&self.conn, &self.meta);
            }
            match GetTask::try_from_command(cmd) {
                Ok(get) => pending = Some(get),
                Err(cmd) => task::execute_single(&mut self.conn, &self.meta, cmd),
            }
        }

        if let Some(get) = pending.take() {
            get.execute(&self.conn, &self.meta);
        }
    }
}
