// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use crate::errors::Error;
use crate::machine::{Machine, Transition};
use async_std::channel::{bounded, unbounded, Receiver, Sender};
use async_std::sync::{Mutex, RwLock};
use async_std::task;
use db::Store;
use flo_stream::{MessagePublisher, Publisher, Subscriber};
use fvm_ipld_encoding::Cbor;
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::Arc;

const NOTIFICATION_BUFFER: usize = 50;

enum Envelope<M: Machine> {
    Event(M::Event, Option<Sender<Result<(), Error>>>),
}

/// Handle given to entry handlers for triggering follow-up events on their
/// own deal. Triggering never blocks; the event is applied after the current
/// handler returns.
pub struct Ctx<M: Machine> {
    key: M::Key,
    tx: Sender<Envelope<M>>,
}

impl<M: Machine> Clone for Ctx<M> {
    fn clone(&self) -> Self {
        Ctx {
            key: self.key.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<M: Machine> Ctx<M> {
    pub fn key(&self) -> &M::Key {
        &self.key
    }

    pub fn trigger(&self, event: M::Event) {
        if self
            .tx
            .try_send(Envelope::Event(event, None))
            .is_err()
        {
            warn!("deal {}: dropping event triggered after shutdown", self.key);
        }
    }
}

/// A persistent table of running state machines, one per deal key.
///
/// Events for a single key are applied in `send` order, strictly one at a
/// time; machines for different keys progress in parallel.
pub struct StateGroup<M: Machine, DB> {
    inner: Arc<GroupInner<M, DB>>,
}

impl<M: Machine, DB> Clone for StateGroup<M, DB> {
    fn clone(&self) -> Self {
        StateGroup {
            inner: self.inner.clone(),
        }
    }
}

struct GroupInner<M: Machine, DB> {
    db: DB,
    ns: String,
    env: Arc<M::Environment>,
    workers: RwLock<HashMap<M::Key, Sender<Envelope<M>>>>,
    publisher: Mutex<Publisher<(M::Event, M::Record)>>,
}

impl<M: Machine, DB: Store + Send + Sync + 'static> GroupInner<M, DB> {
    fn record_key(&self, key: &M::Key) -> String {
        format!("{}/{}", self.ns, key)
    }

    fn persist(&self, key: &M::Key, record: &M::Record) -> Result<(), Error> {
        let bz = record.marshal_cbor()?;
        self.db.write(self.record_key(key), bz)?;
        Ok(())
    }

    async fn publish(&self, event: M::Event, record: M::Record) {
        self.publisher.lock().await.publish((event, record)).await;
    }
}

impl<M: Machine, DB: Store + Send + Sync + 'static> StateGroup<M, DB> {
    /// Opens the group over the given datastore namespace, resuming every
    /// persisted machine. Entry handlers of non-final states are re-run so
    /// that suspended work (chain waits, data transfers) is picked back up.
    pub async fn resume(db: DB, ns: &str, env: Arc<M::Environment>) -> Result<Self, Error> {
        let group = StateGroup {
            inner: Arc::new(GroupInner {
                db,
                ns: ns.to_string(),
                env,
                workers: RwLock::new(HashMap::new()),
                publisher: Mutex::new(Publisher::new(NOTIFICATION_BUFFER)),
            }),
        };

        let prefix = format!("{}/", group.inner.ns);
        let mut workers = group.inner.workers.write().await;
        for key in group.inner.db.prefixed_keys(&prefix)? {
            let bz = group
                .inner
                .db
                .read(&key)?
                .ok_or_else(|| Error::Other("datastore key vanished during resume".to_string()))?;
            let record = M::Record::unmarshal_cbor(&bz)?;
            let tx = spawn_worker(group.inner.clone(), record.clone(), true);
            workers.insert(M::key(&record), tx);
        }
        drop(workers);

        Ok(group)
    }

    /// Inserts a new machine at the record's current state. No handler runs
    /// until the first event is sent. Fails if the key is already tracked.
    pub async fn begin(&self, record: M::Record) -> Result<(), Error> {
        let key = M::key(&record);
        let mut workers = self.inner.workers.write().await;
        if workers.contains_key(&key) {
            return Err(Error::AlreadyExists(key.to_string()));
        }
        self.inner.persist(&key, &record)?;
        let tx = spawn_worker(self.inner.clone(), record, false);
        workers.insert(key, tx);
        Ok(())
    }

    /// Queues an event for the given deal. Returns once the event has been
    /// applied and the post-state durably written, before any entry handler
    /// it schedules completes. Unplanned events resolve `Ok` after being
    /// dropped with a warning.
    pub async fn send(&self, key: &M::Key, event: M::Event) -> Result<(), Error> {
        let tx = {
            let workers = self.inner.workers.read().await;
            workers
                .get(key)
                .ok_or_else(|| Error::NotFound(key.to_string()))?
                .clone()
        };
        let (ack_tx, ack_rx) = bounded(1);
        tx.try_send(Envelope::Event(event, Some(ack_tx)))
            .map_err(|_| Error::Closed)?;
        ack_rx.recv().await.map_err(|_| Error::Closed)?
    }

    /// Reads the persisted snapshot of one deal.
    pub async fn get(&self, key: &M::Key) -> Result<M::Record, Error> {
        let bz = self
            .inner
            .db
            .read(self.inner.record_key(key))?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        Ok(M::Record::unmarshal_cbor(&bz)?)
    }

    /// Reads persisted snapshots of every tracked deal, finished ones
    /// included.
    pub async fn list(&self) -> Result<Vec<M::Record>, Error> {
        let prefix = format!("{}/", self.inner.ns);
        let mut out = Vec::new();
        for key in self.inner.db.prefixed_keys(&prefix)? {
            if let Some(bz) = self.inner.db.read(&key)? {
                out.push(M::Record::unmarshal_cbor(&bz)?);
            }
        }
        Ok(out)
    }

    pub async fn contains(&self, key: &M::Key) -> bool {
        self.inner.workers.read().await.contains_key(key)
    }

    /// Subscribes to `(event, post-state)` notifications, published after the
    /// post-state is durable. Dropping the subscriber unsubscribes.
    pub async fn subscribe(&self) -> Subscriber<(M::Event, M::Record)> {
        self.inner.publisher.lock().await.subscribe()
    }
}

fn spawn_worker<M: Machine, DB: Store + Send + Sync + 'static>(
    inner: Arc<GroupInner<M, DB>>,
    record: M::Record,
    resume: bool,
) -> Sender<Envelope<M>> {
    let (tx, rx) = unbounded();
    let ctx = Ctx {
        key: M::key(&record),
        tx: tx.clone(),
    };
    task::spawn(worker_loop(inner, record, rx, ctx, resume));
    tx
}

async fn worker_loop<M: Machine, DB: Store + Send + Sync + 'static>(
    inner: Arc<GroupInner<M, DB>>,
    mut record: M::Record,
    rx: Receiver<Envelope<M>>,
    ctx: Ctx<M>,
    resume: bool,
) {
    let key = M::key(&record);

    if resume && !M::is_final(M::state(&record)) {
        run_handler(&inner, &ctx, &record).await;
    }

    while let Ok(Envelope::Event(event, ack)) = rx.recv().await {
        let state = M::state(&record);
        if M::is_final(state) {
            debug!(
                "deal {}: ignoring event {:?} received in finality state {:?}",
                key, event, state
            );
            if let Some(ack) = ack {
                let _ = ack.try_send(Ok(()));
            }
            continue;
        }

        let Some(transition) = M::plan(state, &event) else {
            warn!(
                "deal {}: dropping unexpected event {:?} in state {:?}",
                key, event, state
            );
            if let Some(ack) = ack {
                let _ = ack.try_send(Ok(()));
            }
            continue;
        };

        M::apply(&mut record, &event);
        let run_state = match transition {
            Transition::To(next) => {
                M::set_state(&mut record, next);
                Some(next)
            }
            Transition::NoChange => Some(state),
            Transition::JustRecord => None,
        };

        if let Err(e) = inner.persist(&key, &record) {
            error!("deal {}: persisting post-state failed: {}", key, e);
            if let Some(ack) = ack {
                let _ = ack.try_send(Err(e));
            }
            continue;
        }
        if let Some(ack) = ack {
            let _ = ack.try_send(Ok(()));
        }

        inner.publish(event, record.clone()).await;

        match run_state {
            Some(s) if !M::is_final(s) => run_handler(&inner, &ctx, &record).await,
            _ => {}
        }
    }
}

async fn run_handler<M: Machine, DB>(
    inner: &Arc<GroupInner<M, DB>>,
    ctx: &Ctx<M>,
    record: &M::Record,
) {
    if let Err(e) = M::handle(inner.env.clone(), ctx.clone(), record.clone()).await {
        warn!(
            "deal {}: handler for state {:?} errored, deal parked: {}",
            M::key(record),
            M::state(record),
            e
        );
    }
}
