//! Sync coordinator: drains the mutation queue once the network allows.
//!
//! ```text
//!   triggers                       drain (one at a time)
//!   ─────────────────────          ───────────────────────────────────────
//!   channel → Connected  ──┐       peek ─► visit?  ─► VisitSubmitter (HTTP)
//!   connectivity → online ─┼──►          └─ other ─► RealtimeSink (channel)
//!   push while online    ──┘       ok / rejected ─► pop_if(id), next
//!                                  transient     ─► stop (head-of-line)
//! ```
//!
//! Items are applied strictly in queue order. A transient failure leaves the
//! head in place and ends the drain; the next trigger retries it. Visits the
//! server rejects as invalid (HTTP 400/422) are discarded and reported.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::runtime::Handle;

use crate::channel::{ChannelClient, ConnectionStatus};
use crate::connectivity::Connectivity;
use crate::listeners::{ListenerSet, Subscription};
use crate::protocol::ClientMessage;
use crate::queue::{Mutation, MutationQueue, QueueChange, VisitPayload};
use crate::telemetry::Telemetry;

/// Where realtime mutations go.
#[async_trait]
pub trait RealtimeSink: Send + Sync {
    fn is_connected(&self) -> bool;
    /// Hand a message to the live transport, waiting while its buffer is
    /// full; `false` if it was not accepted.
    async fn send_message(&self, message: &ClientMessage) -> bool;
    /// Subscribe to status changes. The channel client also reports the current status immediately.
    fn watch_status(
        &self,
        callback: Box<dyn Fn(&ConnectionStatus) + Send + Sync>,
    ) -> Subscription;
}

#[async_trait]
impl RealtimeSink for ChannelClient {
    fn is_connected(&self) -> bool {
        ChannelClient::is_connected(self)
    }

    async fn send_message(&self, message: &ClientMessage) -> bool {
        self.send_when_ready(message).await
    }

    fn watch_status(
        &self,
        callback: Box<dyn Fn(&ConnectionStatus) + Send + Sync>,
    ) -> Subscription {
        self.on_status_change(move |status| callback(status))
    }
}

/// Why a visit submission failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The server refused the payload itself; retrying cannot help.
    #[error("visit rejected with HTTP {status}")]
    Rejected { status: u16 },
    #[error("visit endpoint answered HTTP {status}")]
    Server { status: u16 },
    #[error("network error: {0}")]
    Network(String),
}

impl SubmitError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => SubmitError::Rejected { status },
            _ => SubmitError::Server { status },
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, SubmitError::Rejected { .. })
    }
}

/// Request channel for check-ins.
#[async_trait]
pub trait VisitSubmitter: Send + Sync {
    async fn submit(&self, visit: &VisitPayload) -> Result<(), SubmitError>;
}

/// POSTs visits as JSON to the visit endpoint.
#[derive(Debug, Clone)]
pub struct HttpVisitSubmitter {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpVisitSubmitter {
    /// `session_cookie` is a full `name=value` pair.
    pub fn new(endpoint: impl Into<String>, session_cookie: Option<&str>) -> Result<Self, SubmitError> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(cookie) = session_cookie {
            headers.insert(
                reqwest::header::COOKIE,
                reqwest::header::HeaderValue::from_str(cookie)
                    .map_err(|e| SubmitError::Network(format!("invalid session cookie: {e}")))?,
            );
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| SubmitError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl VisitSubmitter for HttpVisitSubmitter {
    async fn submit(&self, visit: &VisitPayload) -> Result<(), SubmitError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(visit)
            .send()
            .await
            .map_err(|e| SubmitError::Network(e.to_string()))?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SubmitError::from_status(status.as_u16()))
        }
    }
}

/// Result of one drain request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already running.
    pub skipped: bool,
    pub delivered: usize,
    /// Ids of visits dropped as unrecoverable.
    pub discarded: Vec<String>,
    /// Head item the drain stopped on, if it stopped early.
    pub blocked_on: Option<String>,
}

struct SyncInner {
    queue: Arc<MutationQueue>,
    sink: Arc<dyn RealtimeSink>,
    visits: Arc<dyn VisitSubmitter>,
    connectivity: Connectivity,
    telemetry: Telemetry,
    draining: AtomicBool,
    rerun: AtomicBool,
    visit_synced: ListenerSet<VisitPayload>,
    runtime: Handle,
}

pub struct SyncCoordinator {
    inner: Arc<SyncInner>,
    subscriptions: Vec<Subscription>,
}

impl SyncCoordinator {
    /// Wire the coordinator to its triggers. Must be called inside a tokio runtime.
    pub fn new(
        queue: Arc<MutationQueue>,
        sink: Arc<dyn RealtimeSink>,
        visits: Arc<dyn VisitSubmitter>,
        connectivity: Connectivity,
        telemetry: Telemetry,
    ) -> Self {
        let inner = Arc::new(SyncInner {
            queue,
            sink,
            visits,
            connectivity,
            telemetry,
            draining: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            visit_synced: ListenerSet::new(),
            runtime: Handle::current(),
        });

        let mut subscriptions = Vec::with_capacity(3);

        let weak = Arc::downgrade(&inner);
        subscriptions.push(inner.sink.watch_status(Box::new(move |status| {
            if *status == ConnectionStatus::Connected {
                schedule(&weak);
            }
        })));

        let weak = Arc::downgrade(&inner);
        subscriptions.push(inner.connectivity.on_change(move |online| {
            if *online {
                schedule(&weak);
            }
        }));

        let weak = Arc::downgrade(&inner);
        subscriptions.push(inner.queue.subscribe(move |change| {
            if let QueueChange::Pushed(_) = change {
                if let Some(inner) = weak.upgrade() {
                    if inner.connectivity.is_online() {
                        schedule(&weak);
                    }
                }
            }
        }));

        Self { inner, subscriptions }
    }

    /// Drain now if the network is believed available.
    pub async fn sync(&self) -> DrainReport {
        self.inner.drain(false).await
    }

    /// Drain now even if connectivity reports offline.
    pub async fn force_sync(&self) -> DrainReport {
        self.inner.drain(true).await
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }

    /// Called after each visit the server accepted.
    pub fn on_visit_synced(
        &self,
        listener: impl Fn(&VisitPayload) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.visit_synced.add(listener)
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        for sub in self.subscriptions.drain(..) {
            sub.unsubscribe();
        }
    }
}

fn schedule(weak: &Weak<SyncInner>) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    let runtime = inner.runtime.clone();
    runtime.spawn(async move {
        let report = inner.drain(false).await;
        if report.delivered > 0 || !report.discarded.is_empty() {
            log::info!(
                "Sync drained {} item(s), discarded {}",
                report.delivered,
                report.discarded.len()
            );
        }
    });
}

impl SyncInner {
    fn try_acquire(&self) -> bool {
        self.draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn drain(&self, force: bool) -> DrainReport {
        if !self.try_acquire() {
            self.rerun.store(true, Ordering::SeqCst);
            // The running drain may have finished between the two checks.
            if !self.try_acquire() {
                return DrainReport { skipped: true, ..DrainReport::default() };
            }
        }

        let mut report = DrainReport::default();
        loop {
            self.rerun.store(false, Ordering::SeqCst);
            self.run_pass(force, &mut report).await;
            self.draining.store(false, Ordering::SeqCst);

            if !self.rerun.swap(false, Ordering::SeqCst) || !self.try_acquire() {
                break;
            }
            log::debug!("Sync trigger arrived mid-drain, taking another pass");
        }
        report
    }

    async fn run_pass(&self, force: bool, report: &mut DrainReport) {
        report.blocked_on = None;

        loop {
            if !force && !self.connectivity.is_online() {
                return;
            }
            let Some(item) = self.queue.peek() else {
                return;
            };

            let applied = match &item.mutation {
                Mutation::Visit(visit) => match self.visits.submit(visit).await {
                    Ok(()) => {
                        self.visit_synced.notify(visit);
                        report.delivered += 1;
                        true
                    }
                    Err(e) if e.is_unrecoverable() => {
                        log::warn!("Discarding visit {} to shrine {}: {e}", item.id, visit.shrine_id);
                        self.telemetry.error(
                            "Queued visit rejected by server",
                            &serde_json::json!({
                                "itemId": item.id,
                                "shrineId": visit.shrine_id,
                                "error": e.to_string(),
                            }),
                        );
                        report.discarded.push(item.id.clone());
                        true
                    }
                    Err(e) => {
                        log::info!("Visit {} not synced, will retry: {e}", item.id);
                        false
                    }
                },
                other => {
                    if !self.sink.is_connected() {
                        log::debug!("Channel not connected, pausing sync");
                        report.blocked_on = Some(item.id.clone());
                        return;
                    }
                    let sent = match other.to_client_message() {
                        Some(message) => self.sink.send_message(&message).await,
                        None => false,
                    };
                    if sent {
                        report.delivered += 1;
                    }
                    sent
                }
            };

            if !applied {
                report.blocked_on = Some(item.id.clone());
                return;
            }
            if self.queue.pop_if(&item.id).is_none() {
                log::debug!("Queue head {} changed during sync", item.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Beacon;
    use crate::queue::{QueueConfig, QueueItem};
    use crate::storage::MemoryLocalStore;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    #[derive(Default)]
    struct FakeSink {
        connected: AtomicBool,
        sent: Mutex<Vec<ClientMessage>>,
        status: ListenerSet<ConnectionStatus>,
    }

    impl FakeSink {
        fn connected() -> Arc<Self> {
            let sink = Arc::new(Self::default());
            sink.connected.store(true, Ordering::SeqCst);
            sink
        }

        fn set_connected(&self, connected: bool) {
            self.connected.store(connected, Ordering::SeqCst);
            let status = if connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
            self.status.notify(&status);
        }

        fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RealtimeSink for FakeSink {
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn send_message(&self, message: &ClientMessage) -> bool {
            if !self.is_connected() {
                return false;
            }
            self.sent.lock().unwrap().push(message.clone());
            true
        }

        fn watch_status(
            &self,
            callback: Box<dyn Fn(&ConnectionStatus) + Send + Sync>,
        ) -> Subscription {
            self.status.add(move |s| callback(s))
        }
    }

    /// Answers from a script; `Ok` once the script runs out.
    #[derive(Default)]
    struct ScriptedVisits {
        script: Mutex<VecDeque<Result<(), SubmitError>>>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedVisits {
        fn with(script: Vec<Result<(), SubmitError>>) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()), ..Self::default() })
        }
    }

    #[async_trait]
    impl VisitSubmitter for ScriptedVisits {
        async fn submit(&self, _visit: &VisitPayload) -> Result<(), SubmitError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn visit(shrine: &str) -> Mutation {
        Mutation::Visit(VisitPayload {
            shrine_id: shrine.into(),
            notes: None,
            is_virtual: false,
            latitude: None,
            longitude: None,
            accuracy: None,
        })
    }

    fn queue() -> Arc<MutationQueue> {
        Arc::new(MutationQueue::open(Arc::new(MemoryLocalStore::new()), QueueConfig::default()))
    }

    fn ids(items: &[QueueItem]) -> Vec<String> {
        items.iter().map(|i| i.id.clone()).collect()
    }

    fn coordinator(
        queue: &Arc<MutationQueue>,
        sink: Arc<FakeSink>,
        visits: Arc<ScriptedVisits>,
        connectivity: Connectivity,
    ) -> SyncCoordinator {
        SyncCoordinator::new(queue.clone(), sink, visits, connectivity, Telemetry::local())
    }

    #[test]
    fn test_submit_error_classification() {
        assert!(SubmitError::from_status(400).is_unrecoverable());
        assert!(SubmitError::from_status(422).is_unrecoverable());
        assert!(!SubmitError::from_status(401).is_unrecoverable());
        assert!(!SubmitError::from_status(503).is_unrecoverable());
        assert!(!SubmitError::Network("reset".into()).is_unrecoverable());
    }

    #[tokio::test]
    async fn test_transient_failure_blocks_head() {
        let q = queue();
        let sink = FakeSink::connected();
        let visits = ScriptedVisits::with(vec![Err(SubmitError::Server { status: 503 })]);
        let coord = coordinator(&q, sink.clone(), visits, Connectivity::new(false));

        let a = q.push(visit("1"));
        q.push(Mutation::BeaconSignal(Beacon::Sos));
        q.push(Mutation::Sitrep("c".into()));
        let before = ids(&q.items());

        let report = coord.force_sync().await;
        assert_eq!(report.blocked_on, Some(a.id));
        assert_eq!(report.delivered, 0);
        assert_eq!(ids(&q.items()), before);
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_visit_is_discarded() {
        let q = queue();
        let sink = FakeSink::connected();
        let visits = ScriptedVisits::with(vec![Err(SubmitError::Rejected { status: 422 })]);
        let coord = coordinator(&q, sink.clone(), visits, Connectivity::new(false));

        let bad = q.push(visit("bad"));
        q.push(Mutation::BeaconSignal(Beacon::Regroup));

        let report = coord.force_sync().await;
        assert_eq!(report.discarded, vec![bad.id]);
        assert_eq!(report.delivered, 1);
        assert!(q.is_empty());
        assert_eq!(sink.sent(), vec![ClientMessage::BeaconSignal { signal: Beacon::Regroup }]);
    }

    #[tokio::test]
    async fn test_disconnected_channel_stops_drain() {
        let q = queue();
        let sink = Arc::new(FakeSink::default());
        let visits = ScriptedVisits::with(vec![]);
        let coord = coordinator(&q, sink, visits.clone(), Connectivity::new(false));

        let head = q.push(Mutation::Sitrep("first".into()));
        q.push(visit("after"));

        let report = coord.force_sync().await;
        assert_eq!(report.blocked_on, Some(head.id));
        assert_eq!(q.len(), 2);
        assert_eq!(visits.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_realtime_items_sent_in_order() {
        let q = queue();
        let sink = FakeSink::connected();
        let coord = coordinator(&q, sink.clone(), ScriptedVisits::with(vec![]), Connectivity::new(false));

        q.push(Mutation::Sitrep("one".into()));
        q.push(Mutation::BeaconSignal(Beacon::Moving));
        q.push(Mutation::Sitrep("three".into()));

        let report = coord.force_sync().await;
        assert_eq!(report.delivered, 3);
        assert_eq!(
            sink.sent(),
            vec![
                ClientMessage::Sitrep { text: "one".into() },
                ClientMessage::BeaconSignal { signal: Beacon::Moving },
                ClientMessage::Sitrep { text: "three".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_offline_gate_and_force_sync() {
        let q = queue();
        let sink = FakeSink::connected();
        let coord = coordinator(&q, sink.clone(), ScriptedVisits::with(vec![]), Connectivity::new(false));
        q.push(Mutation::Sitrep("captive portal".into()));

        let report = coord.sync().await;
        assert_eq!(report.delivered, 0);
        assert_eq!(q.len(), 1);

        let report = coord.force_sync().await;
        assert_eq!(report.delivered, 1);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drain_is_skipped() {
        let q = queue();
        let gate = Arc::new(Notify::new());
        let visits = Arc::new(ScriptedVisits { gate: Some(gate.clone()), ..ScriptedVisits::default() });
        let coord = Arc::new(coordinator(&q, FakeSink::connected(), visits, Connectivity::new(false)));
        q.push(visit("slow"));

        let running = {
            let coord = coord.clone();
            tokio::spawn(async move { coord.force_sync().await })
        };
        timeout(Duration::from_secs(2), async {
            while !coord.is_draining() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let second = coord.force_sync().await;
        assert!(second.skipped);

        gate.notify_one();
        let first = running.await.unwrap();
        assert!(!first.skipped);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_connected_status_triggers_drain() {
        let q = queue();
        let sink = Arc::new(FakeSink::default());
        let connectivity = Connectivity::new(true);
        let _coord = coordinator(&q, sink.clone(), ScriptedVisits::with(vec![]), connectivity);

        q.push(Mutation::BeaconSignal(Beacon::Sos));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.len(), 1);

        sink.set_connected(true);
        timeout(Duration::from_secs(2), async {
            while !q.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.sent(), vec![ClientMessage::BeaconSignal { signal: Beacon::Sos }]);
    }

    #[tokio::test]
    async fn test_online_signal_triggers_drain() {
        let q = queue();
        let sink = FakeSink::connected();
        let connectivity = Connectivity::new(false);
        let _coord = coordinator(&q, sink.clone(), ScriptedVisits::with(vec![]), connectivity.clone());

        q.push(Mutation::Sitrep("queued offline".into()));
        connectivity.set_online(true);

        timeout(Duration::from_secs(2), async {
            while !q.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_visit_synced_listener() {
        let q = queue();
        let coord = coordinator(&q, FakeSink::connected(), ScriptedVisits::with(vec![]), Connectivity::new(false));
        let synced = Arc::new(Mutex::new(Vec::new()));
        let s = synced.clone();
        let _sub = coord.on_visit_synced(move |visit| {
            s.lock().unwrap().push(visit.shrine_id.clone());
        });

        q.push(visit("17"));
        coord.force_sync().await;
        assert_eq!(*synced.lock().unwrap(), vec!["17".to_string()]);
    }
}
