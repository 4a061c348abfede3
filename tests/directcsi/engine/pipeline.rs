use async_trait::async_trait;
use direct_csi::directcsi::listener::{Controller, Listener, ListenerContext};
use direct_csi::directcsi::test_support::TestEnv;
use direct_csi::directcsi::util::Keyspace;
use serde_json::Value;
use std::collections::HashMap;
use std::error::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type DynError = Box<dyn Error + Send + Sync>;

#[derive(Default)]
struct Tracking {
    active: HashMap<String, usize>,
    max_concurrent: HashMap<String, usize>,
    handled: Vec<String>,
}

struct TrackingListener {
    partition: &'static str,
    tracking: Arc<Mutex<Tracking>>,
}

impl TrackingListener {
    fn new(partition: &'static str) -> (Self, Arc<Mutex<Tracking>>) {
        let tracking = Arc::new(Mutex::new(Tracking::default()));
        (
            Self {
                partition,
                tracking: Arc::clone(&tracking),
            },
            tracking,
        )
    }

    async fn track(&self, op: &str, key: &str) {
        {
            let mut tracking = self.tracking.lock().expect("tracking lock");
            let active = tracking.active.entry(key.to_string()).or_insert(0);
            *active += 1;
            let active = *active;
            let max = tracking
                .max_concurrent
                .entry(key.to_string())
                .or_insert(0);
            *max = (*max).max(active);
            tracking.handled.push(format!("{} {}", op, key));
        }
        // A suspension point inside the handler: without per-key locking,
        // concurrent versions of one object would overlap here.
        tokio::time::sleep(Duration::from_millis(10)).await;
        let mut tracking = self.tracking.lock().expect("tracking lock");
        *tracking.active.get_mut(key).expect("active entry") -= 1;
    }
}

#[async_trait]
impl Listener for TrackingListener {
    fn name(&self) -> &'static str {
        "tracking"
    }

    fn watch_prefix(&self) -> &'static str {
        "/drives"
    }

    fn list(&self) -> Result<Vec<(String, Value)>, DynError> {
        let mut listing = Vec::new();
        for (key, value, _) in Keyspace::new(self.partition).list("/drives")? {
            let name = key.trim_start_matches("/drives/").to_string();
            listing.push((name, serde_json::from_str(&value)?));
        }
        Ok(listing)
    }

    async fn add(&self, _: &ListenerContext, key: &str, _: Value) -> Result<(), DynError> {
        self.track("add", key).await;
        Ok(())
    }

    async fn update(
        &self,
        _: &ListenerContext,
        key: &str,
        _: Value,
        _: Value,
    ) -> Result<(), DynError> {
        self.track("update", key).await;
        Ok(())
    }

    async fn delete(
        &self,
        _: &ListenerContext,
        key: &str,
        _: Option<Value>,
    ) -> Result<(), DynError> {
        self.track("delete", key).await;
        Ok(())
    }
}

// Events for one object never run concurrently, across a burst of rapid
// updates, while the engine keeps making progress on other keys.
#[tokio::test]
async fn per_object_handlers_are_serialized() {
    let _env = TestEnv::new();
    let keyspace = Keyspace::new("it-engine");
    keyspace
        .put("/drives/d1", "{\"seed\": 1}")
        .expect("seed d1");
    keyspace
        .put("/drives/d2", "{\"seed\": 1}")
        .expect("seed d2");

    let (listener, tracking) = TrackingListener::new("it-engine");
    let mut controller = Controller::new("it-worker", "it-serialized", 4);
    controller.add_listener(Arc::new(listener));

    let cancellation = CancellationToken::new();
    let engine = tokio::spawn(controller.run(Keyspace::new("it-engine-leases"), cancellation.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    for revision in 0..5 {
        keyspace
            .put("/drives/d1", &format!("{{\"seed\": {}}}", revision + 2))
            .expect("update d1");
    }
    keyspace.delete("/drives/d2").expect("delete d2");
    tokio::time::sleep(Duration::from_millis(600)).await;

    cancellation.cancel();
    engine
        .await
        .expect("engine task")
        .expect("engine shuts down cleanly");

    let tracking = tracking.lock().expect("tracking lock");
    for (key, max) in &tracking.max_concurrent {
        assert_eq!(*max, 1, "handlers for {} overlapped", key);
    }
    assert!(
        tracking.handled.iter().any(|entry| entry == "add d1"),
        "initial listing delivered adds: {:?}",
        tracking.handled
    );
    assert!(
        tracking.handled.iter().any(|entry| entry == "update d1"),
        "watch updates delivered: {:?}",
        tracking.handled
    );
    assert!(
        tracking.handled.iter().any(|entry| entry == "delete d2"),
        "watch deletes delivered: {:?}",
        tracking.handled
    );
}

// A second instance campaigning on the same lease processes nothing while
// the first holds it.
#[tokio::test]
async fn only_the_leader_reconciles() {
    let _env = TestEnv::new();
    let keyspace = Keyspace::new("it-leader");
    keyspace
        .put("/drives/d1", "{\"seed\": 1}")
        .expect("seed");

    let (leader_listener, leader_tracking) = TrackingListener::new("it-leader");
    let mut leader = Controller::new("instance-a", "it-leader-lock", 2);
    leader.add_listener(Arc::new(leader_listener));

    let (follower_listener, follower_tracking) = TrackingListener::new("it-leader");
    let mut follower = Controller::new("instance-b", "it-leader-lock", 2);
    follower.add_listener(Arc::new(follower_listener));

    let cancellation = CancellationToken::new();
    let leases = Keyspace::new("it-leader-leases");
    let leader_task = tokio::spawn(leader.run(leases, cancellation.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let follower_task = tokio::spawn(follower.run(leases, cancellation.clone()));

    tokio::time::sleep(Duration::from_millis(500)).await;
    cancellation.cancel();
    leader_task
        .await
        .expect("leader task")
        .expect("leader exits cleanly");
    follower_task
        .await
        .expect("follower task")
        .expect("follower exits cleanly");

    assert!(
        !leader_tracking.lock().unwrap().handled.is_empty(),
        "leader reconciles"
    );
    assert!(
        follower_tracking.lock().unwrap().handled.is_empty(),
        "follower stays idle while the lease is held"
    );
}
