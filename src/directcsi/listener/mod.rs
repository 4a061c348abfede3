/*
 * Copyright (C) 2024 The Direct CSI Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! The reconciliation engine: a leader-elected controller that feeds watch
//! events through a rate-limited work queue into a worker pool.
//!
//! Ordering guarantees: events for one key are delivered in watch order, and
//! a per-(key, listener) mutex ensures at most one handler runs for a given
//! object at a time. Failed handlers are re-enqueued with per-item
//! exponential backoff under a global token bucket.

use crate::directcsi::config::pod_namespace;
use crate::directcsi::logger::{log_error, log_info, log_warn};
use crate::directcsi::util::error::{new_error, with_context};
use crate::directcsi::util::{sanitize_name, Keyspace, KeyspaceEventType};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "listener";

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(5);

const ITEM_BACKOFF_BASE: Duration = Duration::from_millis(100);
const ITEM_BACKOFF_CAP: Duration = Duration::from_secs(600);
const BUCKET_QPS: f64 = 10.0;
const BUCKET_BURST: f64 = 100.0;

const WATCH_BACKOFF_INITIAL: Duration = Duration::from_millis(200);
const WATCH_BACKOFF_MAX: Duration = Duration::from_secs(10);

/// Scoped context handed to every handler invocation. Cancellation fires on
/// shutdown or leadership loss; handlers are expected to give up at their
/// next suspension point.
#[derive(Clone)]
pub struct ListenerContext {
    cancellation: CancellationToken,
}

impl ListenerContext {
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Capability implemented per object kind. Objects travel as raw JSON
/// values; concrete listeners decode them at the schema version they serve.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Keyspace prefix whose events feed this listener.
    fn watch_prefix(&self) -> &'static str;

    /// Full listing used for the initial sync and periodic resyncs.
    fn list(&self) -> Result<Vec<(String, Value)>, DynError>;

    async fn add(&self, ctx: &ListenerContext, key: &str, new: Value) -> Result<(), DynError>;

    async fn update(
        &self,
        ctx: &ListenerContext,
        key: &str,
        old: Value,
        new: Value,
    ) -> Result<(), DynError>;

    async fn delete(&self, ctx: &ListenerContext, key: &str, old: Option<Value>)
        -> Result<(), DynError>;
}

#[derive(Clone)]
enum OpKind {
    Add { new: Value },
    Update { old: Value, new: Value },
    Delete { old: Option<Value> },
}

#[derive(Clone)]
struct Op {
    key: String,
    listener: Arc<dyn Listener>,
    kind: OpKind,
}

impl Op {
    fn kind_label(&self) -> &'static str {
        match self.kind {
            OpKind::Add { .. } => "add",
            OpKind::Update { .. } => "update",
            OpKind::Delete { .. } => "delete",
        }
    }

    /// Identity used for dedup and failure tracking.
    fn dedup_key(&self) -> String {
        format!("{}/{}/{}", self.listener.name(), self.kind_label(), self.key)
    }

    /// Identity used for the serialization mutex: one lock per
    /// (object key, handler), so different kinds do not contend.
    fn lock_key(&self) -> String {
        format!("{}/{}", self.listener.name(), self.key)
    }
}

/// Global token bucket combined with per-item exponential failure backoff.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    qps: f64,
    burst: f64,
}

impl TokenBucket {
    fn new(qps: f64, burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
            qps,
            burst,
        }
    }

    /// Reserves one token, returning how long the caller must wait for it.
    /// Tokens may go negative, pushing later reservations further out.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.last_refill = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

fn item_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(32);
    let delay = ITEM_BACKOFF_BASE.saturating_mul(1u32.checked_shl(exponent).unwrap_or(u32::MAX));
    delay.min(ITEM_BACKOFF_CAP)
}

struct QueueItem {
    op: Op,
    ready_at: Instant,
}

struct QueueState {
    items: VecDeque<QueueItem>,
    failures: HashMap<String, u32>,
    bucket: TokenBucket,
}

/// FIFO deduplicated by (listener, op, key) with delayed readiness.
struct RateLimitedQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    shut_down: AtomicBool,
}

impl RateLimitedQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                failures: HashMap::new(),
                bucket: TokenBucket::new(BUCKET_QPS, BUCKET_BURST),
            }),
            notify: Notify::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Enqueues an op, replacing a pending op with the same identity so a
    /// burst of watch events for one key collapses to the newest payload.
    fn add(&self, op: Op) {
        self.insert(op, Duration::ZERO);
    }

    /// Re-enqueues a failed op with its per-item backoff.
    fn add_rate_limited(&self, op: Op) {
        let delay = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let failures = state
                .failures
                .entry(op.dedup_key())
                .and_modify(|count| *count += 1)
                .or_insert(1)
                .to_owned();
            item_backoff(failures)
        };
        self.insert(op, delay);
    }

    fn insert(&self, op: Op, extra_delay: Duration) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut state = self.state.lock().expect("queue lock poisoned");
        let delay = state.bucket.reserve().max(extra_delay);
        let ready_at = Instant::now() + delay;
        let dedup_key = op.dedup_key();
        if let Some(existing) = state
            .items
            .iter_mut()
            .find(|item| item.op.dedup_key() == dedup_key)
        {
            existing.op = op;
        } else {
            state.items.push_back(QueueItem { op, ready_at });
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Clears the failure history of a successfully processed op.
    fn forget(&self, op: &Op) {
        let mut state = self.state.lock().expect("queue lock poisoned");
        state.failures.remove(&op.dedup_key());
    }

    /// Pops the next ready op, waiting for readiness or shutdown. Interest
    /// in notifications is registered before the queue is inspected so a
    /// concurrent insert cannot slip between check and sleep.
    async fn get(&self) -> Option<Op> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shut_down.load(Ordering::SeqCst) {
                return None;
            }

            let (op, wait) = {
                let mut state = self.state.lock().expect("queue lock poisoned");
                let now = Instant::now();
                if let Some(position) =
                    state.items.iter().position(|item| item.ready_at <= now)
                {
                    (state.items.remove(position).map(|item| item.op), None)
                } else {
                    let wait = state
                        .items
                        .iter()
                        .map(|item| item.ready_at.saturating_duration_since(now))
                        .min();
                    (None, wait)
                }
            };

            if let Some(op) = op {
                return Some(op);
            }
            match wait {
                Some(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// Leader-elected controller driving one or more listeners.
pub struct Controller {
    identity: String,
    leader_lock: String,
    threadiness: usize,
    resync_period: Duration,
    lease_duration: Duration,
    renew_deadline: Duration,
    retry_period: Duration,
    listeners: Vec<Arc<dyn Listener>>,
    startup_hook: Option<Box<dyn Fn() -> Result<(), DynError> + Send + Sync>>,
}

impl Controller {
    pub fn new(identity: impl Into<String>, leader_lock: impl Into<String>, threads: usize) -> Self {
        Self {
            identity: identity.into(),
            leader_lock: leader_lock.into(),
            threadiness: threads.max(1),
            resync_period: DEFAULT_RESYNC_PERIOD,
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            listeners: Vec::new(),
            startup_hook: None,
        }
    }

    /// Runs once after the lease is acquired, before informers start. Used
    /// for the storage-version migration pass; failures are logged and the
    /// pass waits for the next election.
    pub fn set_startup_hook<F>(&mut self, hook: F)
    where
        F: Fn() -> Result<(), DynError> + Send + Sync + 'static,
    {
        self.startup_hook = Some(Box::new(hook));
    }

    pub fn add_listener(&mut self, listener: Arc<dyn Listener>) {
        self.listeners.push(listener);
    }

    /// Campaigns for the leader lease, then runs informers and workers until
    /// cancellation. Loss of an acquired lease is fatal: the error surfaces
    /// to the caller, which exits the process so another instance takes over.
    pub async fn run(
        self,
        keyspace: Keyspace,
        cancellation: CancellationToken,
    ) -> Result<(), DynError> {
        if self.listeners.is_empty() {
            return Err(new_error(
                "Uninitialized controller. At least one listener should be added",
            ));
        }

        let lease_key = format!(
            "/{}",
            sanitize_name(&format!("{}-{}", pod_namespace(), self.leader_lock))
        );

        // Campaign until the lease is ours or shutdown wins.
        loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }
            match keyspace.acquire_lease(&lease_key, &self.identity, self.lease_duration) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => log_warn(
                    COMPONENT,
                    "Lease acquisition attempt failed",
                    &[("lease", &lease_key), ("error", &e.to_string())],
                ),
            }
            tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.retry_period) => {}
            }
        }
        log_info(
            COMPONENT,
            "Became leader, starting controller",
            &[("lease", &lease_key), ("identity", &self.identity)],
        );

        if let Some(hook) = &self.startup_hook {
            if let Err(e) = hook() {
                log_warn(
                    COMPONENT,
                    "Leader startup hook failed; continuing",
                    &[("error", &e.to_string())],
                );
            }
        }

        let scope = cancellation.child_token();
        let queue = Arc::new(RateLimitedQueue::new());
        let lockers: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let ctx = ListenerContext {
            cancellation: scope.clone(),
        };

        let mut tasks = tokio::task::JoinSet::new();
        for listener in &self.listeners {
            tasks.spawn(run_informer(
                Arc::clone(listener),
                keyspace,
                Arc::clone(&queue),
                self.resync_period,
                scope.clone(),
            ));
        }
        for _ in 0..self.threadiness {
            tasks.spawn(run_worker(
                Arc::clone(&queue),
                Arc::clone(&lockers),
                ctx.clone(),
            ));
        }

        // Renew until shutdown; a failed renewal means the lease moved on.
        let outcome = loop {
            tokio::select! {
                _ = cancellation.cancelled() => break Ok(()),
                _ = tokio::time::sleep(self.renew_deadline) => {
                    if let Err(e) = keyspace.renew_lease(&lease_key, &self.identity, self.lease_duration) {
                        log_error(
                            COMPONENT,
                            "Stopped leading",
                            &[("lease", &lease_key), ("error", &e.to_string())],
                        );
                        break Err(with_context(e, "Lost leader lease"));
                    }
                }
            }
        };

        scope.cancel();
        queue.shutdown();
        while tasks.join_next().await.is_some() {}
        let _ = keyspace.release_lease(&lease_key, &self.identity);
        outcome
    }
}

/// List + watch + periodic full resync for one listener. Delta events are
/// deduplicated by object key in the shared queue.
async fn run_informer(
    listener: Arc<dyn Listener>,
    keyspace: Keyspace,
    queue: Arc<RateLimitedQueue>,
    resync_period: Duration,
    cancellation: CancellationToken,
) {
    let mut known: HashMap<String, Value> = HashMap::new();
    let mut last_version = 0u64;
    let mut backoff = WATCH_BACKOFF_INITIAL;

    resync(&listener, &queue, &mut known);
    let mut resync_tick = tokio::time::interval(resync_period);
    resync_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    resync_tick.reset();

    loop {
        let mut stream = keyspace.watch(
            listener.watch_prefix(),
            if last_version == 0 {
                None
            } else {
                Some(last_version)
            },
        );

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => return,
                _ = resync_tick.tick() => {
                    resync(&listener, &queue, &mut known);
                }
                event = stream.next() => match event {
                    Some(event) => {
                        backoff = WATCH_BACKOFF_INITIAL;
                        last_version = event.resource_version;
                        handle_event(&listener, &queue, &mut known, event);
                    }
                    None => break,
                }
            }
        }

        tokio::select! {
            _ = cancellation.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(WATCH_BACKOFF_MAX);
    }
}

fn handle_event(
    listener: &Arc<dyn Listener>,
    queue: &RateLimitedQueue,
    known: &mut HashMap<String, Value>,
    event: crate::directcsi::util::KeyspaceEvent,
) {
    let key = object_key(listener.watch_prefix(), &event.key);
    match event.event_type {
        KeyspaceEventType::Added | KeyspaceEventType::Modified => {
            let new: Value = match event
                .value
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
            {
                Ok(Some(value)) => value,
                _ => {
                    log_warn(
                        COMPONENT,
                        "Dropping watch event without a decodable payload",
                        &[("key", &event.key)],
                    );
                    return;
                }
            };
            match known.insert(key.clone(), new.clone()) {
                Some(old) => queue.add(Op {
                    key,
                    listener: Arc::clone(listener),
                    kind: OpKind::Update { old, new },
                }),
                None => queue.add(Op {
                    key,
                    listener: Arc::clone(listener),
                    kind: OpKind::Add { new },
                }),
            }
        }
        KeyspaceEventType::Deleted => {
            let old = known.remove(&key);
            queue.add(Op {
                key,
                listener: Arc::clone(listener),
                kind: OpKind::Delete { old },
            });
        }
    }
}

/// Full relist: unknown keys become adds, known keys updates, vanished keys
/// deletes. "Replaced/added" always precedes "updated" for a key because the
/// cache decides which op is emitted.
fn resync(
    listener: &Arc<dyn Listener>,
    queue: &RateLimitedQueue,
    known: &mut HashMap<String, Value>,
) {
    let listing = match listener.list() {
        Ok(listing) => listing,
        Err(e) => {
            log_warn(
                COMPONENT,
                "Resync listing failed",
                &[("listener", listener.name()), ("error", &e.to_string())],
            );
            return;
        }
    };

    let mut seen: HashMap<String, Value> = HashMap::new();
    for (key, new) in listing {
        seen.insert(key.clone(), new.clone());
        match known.insert(key.clone(), new.clone()) {
            Some(old) => queue.add(Op {
                key,
                listener: Arc::clone(listener),
                kind: OpKind::Update { old, new },
            }),
            None => queue.add(Op {
                key,
                listener: Arc::clone(listener),
                kind: OpKind::Add { new },
            }),
        }
    }

    let vanished: Vec<String> = known
        .keys()
        .filter(|key| !seen.contains_key(*key))
        .cloned()
        .collect();
    for key in vanished {
        let old = known.remove(&key);
        queue.add(Op {
            key,
            listener: Arc::clone(listener),
            kind: OpKind::Delete { old },
        });
    }
}

async fn run_worker(
    queue: Arc<RateLimitedQueue>,
    lockers: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    ctx: ListenerContext,
) {
    while let Some(op) = queue.get().await {
        // One handler per object at a time; versions of the same object
        // never execute in parallel.
        let lock = {
            let mut map = lockers.lock().expect("locker map poisoned");
            Arc::clone(map.entry(op.lock_key()).or_default())
        };
        let _guard = lock.lock().await;

        let result = match op.kind.clone() {
            OpKind::Add { new } => op.listener.add(&ctx, &op.key, new).await,
            OpKind::Update { old, new } => op.listener.update(&ctx, &op.key, old, new).await,
            OpKind::Delete { old } => op.listener.delete(&ctx, &op.key, old).await,
        };

        match result {
            Ok(()) => queue.forget(&op),
            Err(e) => {
                log_warn(
                    COMPONENT,
                    "Handler failed; re-enqueueing with backoff",
                    &[
                        ("listener", op.listener.name()),
                        ("op", op.kind_label()),
                        ("key", &op.key),
                        ("error", &e.to_string()),
                    ],
                );
                queue.add_rate_limited(op);
            }
        }
    }
}

fn object_key(prefix: &str, event_key: &str) -> String {
    event_key
        .strip_prefix(prefix)
        .map(|rest| rest.trim_start_matches('/'))
        .filter(|rest| !rest.is_empty())
        .unwrap_or(event_key)
        .to_string()
}
