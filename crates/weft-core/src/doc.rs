//! The document handle and its single-consumer executor.
//!
//! All store access is serialized through one spawned task that owns the
//! [`DocStore`]. Work units are closures queued over an unbounded channel;
//! the executor runs them strictly FIFO, and once the queue drains it runs
//! one trailing flush transaction (delivering the outbox to the send hook)
//! before resolving quiescence waiters and going idle. Work requested from
//! the outside therefore never executes reentrant to the caller.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::algorithm::reclaim;
use crate::codec;
use crate::error::{Result, WeftError};
use crate::op::{ClientId, OpId, Operation};
use crate::store::{DocStore, Observer, SendHook};
use crate::txn::Transaction;

/// A unit of work executed against the store, serialized with all others.
pub type WorkUnit =
    Box<dyn FnOnce(&mut Transaction<'_>) -> Result<()> + Send + 'static>;

enum Command {
    Work(WorkUnit),
    Quiesce(oneshot::Sender<()>),
}

/// Construction options for a [`Doc`].
#[derive(Clone)]
pub struct DocOptions {
    /// Reclamation epoch cadence; `None` disables the timer (epochs can
    /// still be triggered through [`Doc::collect_garbage`]).
    pub gc_interval: Option<Duration>,
    /// Hook handed every locally created operation at flush time.
    pub send: Option<SendHook>,
}

impl Default for DocOptions {
    fn default() -> Self {
        DocOptions { gc_interval: Some(Duration::from_secs(50)), send: None }
    }
}

/// Handle to one replica's document engine.
///
/// Cheap to clone; all clones feed the same executor task. Dropping the
/// last handle shuts the executor down.
#[derive(Clone)]
pub struct Doc {
    tx: mpsc::UnboundedSender<Command>,
    client: ClientId,
}

impl Doc {
    /// Spawns the executor for a new replica. `client` must not be the
    /// reserved root client. Must be called inside a tokio runtime.
    pub fn new(client: ClientId, opts: DocOptions) -> Result<Doc> {
        let mut store = DocStore::new(client)?;
        store.send_hook = opts.send;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_executor(store, rx));
        if let Some(interval) = opts.gc_interval {
            let weak = tx.downgrade();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let Some(tx) = weak.upgrade() else { break };
                    let unit: WorkUnit =
                        Box::new(|txn| reclaim::collect_epoch(txn).map(|_| ()));
                    if tx.send(Command::Work(unit)).is_err() {
                        break;
                    }
                }
            });
        }
        Ok(Doc { tx, client })
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Queues a unit of work. Returns as soon as it is queued; the unit
    /// runs asynchronously, never inline with the caller.
    pub fn request_transaction<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<()> + Send + 'static,
    {
        self.tx
            .send(Command::Work(Box::new(f)))
            .map_err(|_| WeftError::EngineClosed)
    }

    /// Queues a unit of work and awaits its result.
    pub async fn transact<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let unit: WorkUnit = Box::new(move |txn| {
            let _ = done.send(f(txn));
            Ok(())
        });
        self.tx
            .send(Command::Work(unit))
            .map_err(|_| WeftError::EngineClosed)?;
        rx.await.map_err(|_| WeftError::EngineClosed)?
    }

    /// Entry point for remote delivery.
    pub fn apply(&self, ops: Vec<Operation>) -> Result<()> {
        self.request_transaction(move |txn| txn.apply_remote(ops))
    }

    /// Remote delivery of a binary message. An undecodable message is
    /// dropped with a warning; it must not take the engine down.
    pub fn apply_encoded(&self, buf: Bytes) -> Result<()> {
        match codec::decode_operations(buf) {
            Ok(ops) => self.apply(ops),
            Err(err) => {
                warn!(%err, "dropping undecodable message");
                Ok(())
            }
        }
    }

    /// Resolves once every queued transaction has run and the queue is
    /// provably empty, including work queued while waiting.
    pub async fn when_transactions_finished(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Command::Quiesce(done))
            .map_err(|_| WeftError::EngineClosed)?;
        rx.await.map_err(|_| WeftError::EngineClosed)
    }

    /// Triggers one reclamation epoch out of cadence.
    pub async fn collect_garbage(&self) -> Result<bool> {
        self.transact(reclaim::collect_epoch).await
    }

    /// Unqueues every reclamation candidate (used when going offline).
    pub async fn stop_garbage_collector(&self) -> Result<()> {
        self.transact(reclaim::stop_garbage_collector).await
    }

    /// Marks whether every replica is known to have seen every operation;
    /// reclamation epochs only run while this holds.
    pub fn set_synced(&self, synced: bool) -> Result<()> {
        self.request_transaction(move |txn| {
            txn.store.synced = synced;
            Ok(())
        })
    }

    pub fn set_connected(&self, connected: bool) -> Result<()> {
        self.request_transaction(move |txn| {
            txn.store.connected = connected;
            Ok(())
        })
    }

    /// Registers a change callback on a container.
    pub fn observe(&self, target: OpId, cb: Observer) -> Result<()> {
        self.request_transaction(move |txn| {
            txn.observe(target, cb);
            Ok(())
        })
    }
}

async fn run_executor(mut store: DocStore, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut waiters: Vec<oneshot::Sender<()>> = Vec::new();
    while let Some(first) = rx.recv().await {
        let mut pending = VecDeque::new();
        pending.push_back(first);
        loop {
            while let Some(cmd) = pending.pop_front() {
                match cmd {
                    Command::Work(unit) => {
                        let mut txn = Transaction::new(&mut store);
                        if let Err(err) = unit(&mut txn) {
                            error!(%err, "transaction failed");
                        }
                    }
                    Command::Quiesce(done) => waiters.push(done),
                }
                while let Ok(cmd) = rx.try_recv() {
                    pending.push_back(cmd);
                }
            }
            // the queue looks empty: run the trailing flush, then check
            // again before resolving waiters
            {
                let mut txn = Transaction::new(&mut store);
                if let Err(err) = txn.flush() {
                    error!(%err, "flush failed");
                }
            }
            match rx.try_recv() {
                Ok(cmd) => pending.push_back(cmd),
                Err(_) => {
                    for done in waiters.drain(..) {
                        let _ = done.send(());
                    }
                    break;
                }
            }
        }
    }
}
