//! End-to-end checks of the dispatch pipeline with in-process fakes for the
//! registry, the channel directory, the connectors and the bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lib_fanout::connections::{BusError, BusSubscription, KvStore, MemoryStore};
use lib_fanout::core::{
    BoxError, DispatchError, DispatchReport, DispatchSettings, Dispatcher, InstanceSource, RegistryClient, RegistryError,
    RoutingError, RoutingTable, ServiceInstance, TransformFn, WorkerPool,
};
use lib_fanout::models::ChannelMessage;
use lib_fanout::rpc::{ChannelDirectory, Connector, ConnectorHandle, DirectoryHandle, RpcError};

const ROUTES: &str = "user:connectors";

struct StaticSource {
    instances: HashMap<String, Vec<ServiceInstance>>,
}

#[async_trait]
impl InstanceSource for StaticSource {
    async fn healthy_instances(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        Ok(self.instances.get(service).cloned().unwrap_or_default())
    }
}

fn instance(service: &str, id: &str) -> ServiceInstance {
    ServiceInstance {
        service_id: id.to_string(),
        service_name: service.to_string(),
        address: "127.0.0.1".to_string(),
        port: 9000,
    }
}

#[derive(Default)]
struct FakeDirectory {
    channels: HashMap<String, Vec<String>>,
    delay: Duration,
    broken: bool,
}

impl FakeDirectory {
    fn with_channels(channels: &[(&str, &[&str])]) -> Self {
        Self {
            channels: channels
                .iter()
                .map(|(channel, members)| (channel.to_string(), members.iter().map(|m| m.to_string()).collect()))
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChannelDirectory for FakeDirectory {
    async fn list_members(&self, channel_id: &str) -> Result<Vec<String>, RpcError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.broken {
            return Err(RpcError::Status(tonic::Status::internal("membership store down")));
        }
        Ok(self.channels.get(channel_id).cloned().unwrap_or_default())
    }
}

#[derive(Clone, Copy)]
enum Outcome {
    Reject,
    Unavailable,
    Stall,
}

/// Shared view of every delivery attempted by any fake connector.
#[derive(Default)]
struct Deliveries {
    delivered: Mutex<Vec<(String, String, String)>>,
    outcomes: HashMap<String, Outcome>,
    delay: Duration,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Deliveries {
    fn delivered(&self) -> Vec<(String, String, String)> {
        let mut all = self.delivered.lock().unwrap().clone();
        all.sort();
        all
    }
}

struct FakeConnector {
    key: String,
    log: Arc<Deliveries>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn dispatch(&self, target_user_id: &str, message: &ChannelMessage) -> Result<(), RpcError> {
        if let Some(Outcome::Stall) = self.log.outcomes.get(target_user_id) {
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Ok(());
        }

        let running = self.log.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.peak.fetch_max(running, Ordering::SeqCst);
        if !self.log.delay.is_zero() {
            tokio::time::sleep(self.log.delay).await;
        }
        self.log.current.fetch_sub(1, Ordering::SeqCst);

        match self.log.outcomes.get(target_user_id) {
            Some(Outcome::Reject) => Err(RpcError::Rejected(target_user_id.to_string())),
            Some(Outcome::Unavailable) => Err(RpcError::Status(tonic::Status::unavailable("connector shutting down"))),
            Some(Outcome::Stall) | None => {
                self.log.delivered.lock().unwrap().push((
                    self.key.clone(),
                    target_user_id.to_string(),
                    message.message_id.clone(),
                ));
                Ok(())
            }
        }
    }
}

struct Harness {
    dispatcher: Dispatcher,
    connectors: Arc<RoutingTable<ConnectorHandle>>,
    pool: Arc<WorkerPool>,
    store: Arc<MemoryStore>,
    log: Arc<Deliveries>,
}

async fn harness(channels: &[(&str, &[&str])], connector_ids: &[&str], log: Deliveries, pool_size: usize) -> Harness {
    harness_with(FakeDirectory::with_channels(channels), connector_ids, log, pool_size).await
}

async fn harness_with(directory: FakeDirectory, connector_ids: &[&str], log: Deliveries, pool_size: usize) -> Harness {
    let mut instances = HashMap::new();
    instances.insert("ChannelService".to_string(), vec![instance("ChannelService", "dir-1")]);
    instances.insert(
        "ConnectorService".to_string(),
        connector_ids.iter().map(|id| instance("ConnectorService", id)).collect(),
    );
    let source: Arc<dyn InstanceSource> = Arc::new(StaticSource { instances });

    let directory: DirectoryHandle = Arc::new(directory);
    let directory_transform: TransformFn<DirectoryHandle> =
        Arc::new(move |_: &ServiceInstance| -> Result<DirectoryHandle, BoxError> { Ok(Arc::clone(&directory)) });
    let directory_table = Arc::new(RoutingTable::new(
        "ChannelService",
        Arc::new(RegistryClient::new(Arc::clone(&source), directory_transform, None)),
    ));
    directory_table.refresh().await.unwrap();

    let log = Arc::new(log);
    let connector_log = Arc::clone(&log);
    let connector_transform: TransformFn<ConnectorHandle> =
        Arc::new(move |inst: &ServiceInstance| -> Result<ConnectorHandle, BoxError> {
            Ok(Arc::new(FakeConnector {
                key: inst.key(),
                log: Arc::clone(&connector_log),
            }))
        });
    let connectors = Arc::new(RoutingTable::new(
        "ConnectorService",
        Arc::new(RegistryClient::new(source, connector_transform, None)),
    ));
    connectors.refresh().await.unwrap();

    let store = Arc::new(MemoryStore::new());
    let pool = Arc::new(WorkerPool::new(pool_size).unwrap());
    let dispatcher = Dispatcher::new(
        directory_table,
        Arc::clone(&connectors),
        Arc::clone(&store) as Arc<dyn KvStore>,
        Arc::clone(&pool),
        DispatchSettings {
            rpc_timeout: Duration::from_secs(2),
            routing_hash_key: ROUTES.to_string(),
        },
    );

    Harness {
        dispatcher,
        connectors,
        pool,
        store,
        log,
    }
}

fn message(id: &str, channel: &str) -> ChannelMessage {
    ChannelMessage {
        message_id: id.to_string(),
        channel_id: channel.to_string(),
        sender_id: "u1".to_string(),
        content: "hello".to_string(),
        created_at: 1_700_000_000,
    }
}

fn delivered(connector: &str, user: &str, message_id: &str) -> (String, String, String) {
    (format!("ConnectorService:{connector}"), user.to_string(), message_id.to_string())
}

#[tokio::test]
async fn test_only_online_members_receive_the_message() {
    let h = harness(&[("c1", &["u1", "u2", "u3"])], &["conn-a", "conn-b"], Deliveries::default(), 8).await;
    h.store.set_hash_field(ROUTES, "u1", "ConnectorService:conn-a");
    h.store.set_hash_field(ROUTES, "u3", "ConnectorService:conn-b");

    let report = h.dispatcher.dispatch(Arc::new(message("m1", "c1"))).await.unwrap();
    assert_eq!(
        report,
        DispatchReport {
            members: 3,
            offline: 1,
            unroutable: 0,
            submitted: 2,
        }
    );

    assert!(h.pool.release(Duration::from_secs(1)).await);
    assert_eq!(
        h.log.delivered(),
        vec![delivered("conn-a", "u1", "m1"), delivered("conn-b", "u3", "m1")]
    );
}

#[tokio::test]
async fn test_failed_delivery_does_not_affect_the_others() {
    let log = Deliveries {
        outcomes: HashMap::from([("u2".to_string(), Outcome::Reject)]),
        ..Default::default()
    };
    let h = harness(&[("c1", &["u1", "u2", "u3", "u4"])], &["conn-a"], log, 8).await;
    h.store.set_hash_field(ROUTES, "u1", "ConnectorService:conn-a");
    h.store.set_hash_field(ROUTES, "u2", "ConnectorService:conn-a");
    h.store.set_hash_field(ROUTES, "u3", "ConnectorService:gone");
    h.store.set_hash_field(ROUTES, "u4", "");

    let report = h.dispatcher.dispatch(Arc::new(message("m2", "c1"))).await.unwrap();
    assert_eq!(report.offline, 1);
    assert_eq!(report.unroutable, 1);
    assert_eq!(report.submitted, 2);

    assert!(h.pool.release(Duration::from_secs(1)).await);
    assert_eq!(h.log.delivered(), vec![delivered("conn-a", "u1", "m2")]);
}

#[tokio::test]
async fn test_unavailable_connector_is_evicted() {
    let log = Deliveries {
        outcomes: HashMap::from([("u2".to_string(), Outcome::Unavailable)]),
        ..Default::default()
    };
    let h = harness(&[("c1", &["u2"])], &["conn-a", "conn-b"], log, 4).await;
    h.store.set_hash_field(ROUTES, "u2", "ConnectorService:conn-b");

    h.dispatcher.dispatch(Arc::new(message("m3", "c1"))).await.unwrap();
    assert!(h.pool.release(Duration::from_secs(1)).await);

    assert!(matches!(
        h.connectors.get("ConnectorService:conn-b"),
        Err(RoutingError::UnknownInstance { .. })
    ));
    assert!(h.connectors.get("ConnectorService:conn-a").is_ok());
}

#[tokio::test]
async fn test_fan_out_never_exceeds_pool_capacity() {
    let members = ["u1", "u2", "u3", "u4", "u5", "u6", "u7", "u8"];
    let log = Deliveries {
        delay: Duration::from_millis(30),
        ..Default::default()
    };
    let h = harness(&[("big", &members)], &["conn-a"], log, 2).await;
    for user in members {
        h.store.set_hash_field(ROUTES, user, "ConnectorService:conn-a");
    }

    let report = h.dispatcher.dispatch(Arc::new(message("m4", "big"))).await.unwrap();
    assert_eq!(report.submitted, members.len());

    assert!(h.pool.release(Duration::from_secs(5)).await);
    assert_eq!(h.log.delivered().len(), members.len());
    assert!(h.log.peak.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_malformed_payload_is_rejected_without_side_effects() {
    let h = harness(&[("c1", &["u1"])], &["conn-a"], Deliveries::default(), 4).await;
    h.store.set_hash_field(ROUTES, "u1", "ConnectorService:conn-a");

    let err = h.dispatcher.dispatch_payload(b"{not json").await.unwrap_err();
    assert!(matches!(err, DispatchError::Decode(_)));

    assert!(h.pool.release(Duration::from_secs(1)).await);
    assert!(h.log.delivered().is_empty());
}

#[tokio::test]
async fn test_empty_channel_and_missing_directory() {
    let h = harness(&[], &["conn-a"], Deliveries::default(), 4).await;
    let report = h.dispatcher.dispatch(Arc::new(message("m5", "nobody"))).await.unwrap();
    assert_eq!(report, DispatchReport::default());

    let store = Arc::new(MemoryStore::new());
    let source: Arc<dyn InstanceSource> = Arc::new(StaticSource {
        instances: HashMap::new(),
    });
    let no_directory: TransformFn<DirectoryHandle> =
        Arc::new(|_: &ServiceInstance| -> Result<DirectoryHandle, BoxError> { Err("unused".into()) });
    let empty_directory = Arc::new(RoutingTable::new(
        "ChannelService",
        Arc::new(RegistryClient::new(source, no_directory, None)),
    ));
    let dispatcher = Dispatcher::new(
        empty_directory,
        Arc::clone(&h.connectors),
        store as Arc<dyn KvStore>,
        Arc::new(WorkerPool::new(1).unwrap()),
        DispatchSettings::default(),
    );
    let err = dispatcher.dispatch(Arc::new(message("m6", "c1"))).await.unwrap_err();
    assert!(matches!(err, DispatchError::Routing(RoutingError::NoInstanceAvailable(_))));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_delivery_times_out_and_frees_its_worker() {
    let log = Deliveries {
        outcomes: HashMap::from([("slow".to_string(), Outcome::Stall)]),
        ..Default::default()
    };
    let h = harness(&[("c1", &["slow", "u1"])], &["conn-a"], log, 1).await;
    h.store.set_hash_field(ROUTES, "slow", "ConnectorService:conn-a");
    h.store.set_hash_field(ROUTES, "u1", "ConnectorService:conn-a");

    let started = tokio::time::Instant::now();
    let report = h.dispatcher.dispatch(Arc::new(message("m9", "c1"))).await.unwrap();
    assert_eq!(report.submitted, 2);
    // The single worker was held by the stalled delivery until its deadline.
    assert!(started.elapsed() >= Duration::from_secs(2));

    assert!(h.pool.release(Duration::from_secs(10)).await);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(h.log.delivered(), vec![delivered("conn-a", "u1", "m9")]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_membership_lookup_abandons_the_message() {
    let directory = FakeDirectory {
        delay: Duration::from_secs(10),
        ..FakeDirectory::with_channels(&[("c1", &["u1"])])
    };
    let h = harness_with(directory, &["conn-a"], Deliveries::default(), 4).await;
    h.store.set_hash_field(ROUTES, "u1", "ConnectorService:conn-a");

    let started = tokio::time::Instant::now();
    let err = h.dispatcher.dispatch(Arc::new(message("m10", "c1"))).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::MembershipTimeout { ref channel_id, timeout }
            if channel_id == "c1" && timeout == Duration::from_secs(2)
    ));
    assert!(started.elapsed() < Duration::from_secs(10));

    assert!(h.pool.release(Duration::from_secs(1)).await);
    assert!(h.log.delivered().is_empty());
}

#[tokio::test]
async fn test_membership_failure_abandons_the_message() {
    let directory = FakeDirectory {
        broken: true,
        ..FakeDirectory::with_channels(&[("c1", &["u1"])])
    };
    let h = harness_with(directory, &["conn-a"], Deliveries::default(), 4).await;
    h.store.set_hash_field(ROUTES, "u1", "ConnectorService:conn-a");

    let err = h.dispatcher.dispatch(Arc::new(message("m11", "c1"))).await.unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Membership { ref channel_id, source: RpcError::Status(ref status) }
            if channel_id == "c1" && status.code() == tonic::Code::Internal
    ));

    assert!(h.pool.release(Duration::from_secs(1)).await);
    assert!(h.log.delivered().is_empty());
}

struct ChannelSubscription {
    rx: mpsc::UnboundedReceiver<Bytes>,
    unsubscribed: Arc<AtomicBool>,
}

#[async_trait]
impl BusSubscription for ChannelSubscription {
    async fn next_payload(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    async fn unsubscribe(&mut self) -> Result<(), BusError> {
        self.unsubscribed.store(true, Ordering::SeqCst);
        self.rx.close();
        Ok(())
    }
}

#[tokio::test]
async fn test_run_loop_survives_bad_messages_until_the_bus_closes() {
    let h = harness(&[("c1", &["u1"])], &["conn-a"], Deliveries::default(), 4).await;
    h.store.set_hash_field(ROUTES, "u1", "ConnectorService:conn-a");

    let (tx, rx) = mpsc::unbounded_channel();
    let unsubscribed = Arc::new(AtomicBool::new(false));
    let mut subscription = ChannelSubscription {
        rx,
        unsubscribed: Arc::clone(&unsubscribed),
    };

    tx.send(Bytes::from_static(b"garbage")).unwrap();
    tx.send(Bytes::from(message("m7", "c1").encode().unwrap())).unwrap();
    tx.send(Bytes::from(message("m8", "unknown-channel").encode().unwrap())).unwrap();
    drop(tx);

    h.dispatcher.run(&mut subscription, CancellationToken::new()).await;
    assert!(unsubscribed.load(Ordering::SeqCst));

    assert!(h.pool.release(Duration::from_secs(1)).await);
    assert_eq!(h.log.delivered(), vec![delivered("conn-a", "u1", "m7")]);
}

#[tokio::test]
async fn test_run_loop_stops_on_cancellation() {
    let h = harness(&[("c1", &["u1"])], &["conn-a"], Deliveries::default(), 4).await;
    let (_tx, rx) = mpsc::unbounded_channel();
    let unsubscribed = Arc::new(AtomicBool::new(false));
    let mut subscription = ChannelSubscription {
        rx,
        unsubscribed: Arc::clone(&unsubscribed),
    };

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    tokio::time::timeout(Duration::from_secs(2), h.dispatcher.run(&mut subscription, shutdown))
        .await
        .expect("run loop must stop after cancellation");
    assert!(unsubscribed.load(Ordering::SeqCst));
}
