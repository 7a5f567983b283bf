//! Cyclic polling engine
//!
//! Reads every receivable point of an interface on a fixed cycle, executing
//! the merged read plan and distributing each response through the shared
//! device memory. One failing request never aborts a cycle; its member
//! points get individual errors and the remaining requests still run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientRequest, ClientResponse, ProtocolClient};
use crate::error::{PointLinkError, Result};
use crate::events::{CycleError, Direction, EngineEvent};
use crate::interface::Interface;
use crate::point::PointAddress;
use crate::scheduler::merge::{build_read_plan, MergeOptions, ReadRequest, ReadSpan};

/// Polling engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Cycle period in milliseconds
    #[serde(default = "default_cycle_ms")]
    pub cycle_ms: u64,
    /// Merge adjacent point windows into batched reads
    #[serde(default = "default_enable_merge")]
    pub enable_merge: bool,
    /// Gap (in addressable units) merged reads may span
    #[serde(default)]
    pub merge_span_tolerance: u16,
    /// Issue the cycle's requests concurrently when the client allows it
    #[serde(default)]
    pub parallel_requests: bool,
}

fn default_cycle_ms() -> u64 {
    1000
}
fn default_enable_merge() -> bool {
    true
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            cycle_ms: default_cycle_ms(),
            enable_merge: default_enable_merge(),
            merge_span_tolerance: 0,
            parallel_requests: false,
        }
    }
}

/// Cumulative polling statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollStats {
    pub cycles: u64,
    pub requests_sent: u64,
    pub requests_failed: u64,
    pub points_updated: u64,
    pub last_cycle_ms: f64,
    pub last_cycle_time: Option<DateTime<Utc>>,
}

struct EngineInner {
    interface: Interface,
    client: Arc<dyn ProtocolClient>,
    config: PollingConfig,
    wake: Notify,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stats: RwLock<PollStats>,
}

/// Cyclic reader for one interface/client pair
#[derive(Clone)]
pub struct PollEngine {
    inner: Arc<EngineInner>,
}

impl PollEngine {
    pub fn new(
        interface: Interface,
        client: Arc<dyn ProtocolClient>,
        config: PollingConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                interface,
                client,
                config,
                wake: Notify::new(),
                cancel: parking_lot::Mutex::new(None),
                task: tokio::sync::Mutex::new(None),
                stats: RwLock::new(PollStats::default()),
            }),
        }
    }

    /// Start the poll loop; fails if already running
    pub async fn start(&self) -> Result<()> {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return Err(PointLinkError::config("Poll engine is already running"));
        }
        let cancel = CancellationToken::new();
        *self.inner.cancel.lock() = Some(cancel.clone());
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(run_loop(inner, cancel)));
        info!(cycle_ms = self.inner.config.cycle_ms, "Poll engine started");
        Ok(())
    }

    /// Stop the poll loop and wait for the in-flight cycle to finish
    pub async fn stop(&self) {
        if let Some(cancel) = self.inner.cancel.lock().take() {
            cancel.cancel();
        }
        self.inner.wake.notify_one();
        let handle = self.inner.task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Poll engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.cancel.lock().is_some()
    }

    /// Cut the current inter-cycle wait short and poll immediately
    pub fn poll_now(&self) {
        self.inner.wake.notify_one();
    }

    pub fn stats(&self) -> PollStats {
        self.inner.stats.read().clone()
    }
}

async fn run_loop(inner: Arc<EngineInner>, cancel: CancellationToken) {
    let mut plan: Option<Vec<ReadRequest>> = None;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let started = Instant::now();

        // Rebuild the plan lazily: only when points were added, removed or
        // re-addressed since the last cycle.
        if inner.interface.take_topology_changed() || plan.is_none() {
            let rebuilt = plan_for_interface(&inner.interface, &inner.client, &inner.config);
            debug!(requests = rebuilt.len(), "Read plan rebuilt");
            plan = Some(rebuilt);
        }
        let requests = plan.as_deref().unwrap_or(&[]);

        let (succeed, errors) = run_cycle(
            &inner.interface,
            &inner.client,
            &inner.config,
            requests,
            &inner.stats,
        )
        .await;

        let elapsed = started.elapsed();
        {
            let mut stats = inner.stats.write();
            stats.cycles += 1;
            stats.last_cycle_ms = elapsed.as_secs_f64() * 1000.0;
            stats.last_cycle_time = Some(Utc::now());
        }
        inner
            .interface
            .emit(EngineEvent::CycleCompleted { succeed, errors });

        let period = Duration::from_millis(inner.config.cycle_ms);
        let remaining = period.saturating_sub(elapsed);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = inner.wake.notified() => {},
            _ = tokio::time::sleep(remaining) => {},
        }
    }
}

/// Collect the read plan for every receivable point of the interface
pub(crate) fn plan_for_interface(
    interface: &Interface,
    client: &Arc<dyn ProtocolClient>,
    config: &PollingConfig,
) -> Vec<ReadRequest> {
    let mut spans = Vec::new();
    for (handle, point) in interface.points() {
        if !point.handler().mode().can_receive() {
            continue;
        }
        let address = point.address();
        let (start, length) = point.request_span();
        spans.push(ReadSpan {
            handle,
            slave: address.slave,
            kind: address.kind,
            start,
            length,
        });
    }
    let options = MergeOptions {
        enabled: config.enable_merge,
        span_tolerance: config.merge_span_tolerance,
    };
    build_read_plan(&spans, &client.limits(), &options)
}

/// Execute one cycle of the given plan
///
/// Returns whether at least one request succeeded, plus one aggregate
/// error per failed request.
pub(crate) async fn run_cycle(
    interface: &Interface,
    client: &Arc<dyn ProtocolClient>,
    config: &PollingConfig,
    plan: &[ReadRequest],
    stats: &RwLock<PollStats>,
) -> (bool, Vec<CycleError>) {
    if plan.is_empty() {
        return (true, Vec::new());
    }

    let outcomes: Vec<Result<Vec<u16>>> =
        if config.parallel_requests && client.supports_concurrent_requests() {
            let futures = plan.iter().map(|request| {
                let client = Arc::clone(client);
                let request = request.clone();
                async move { execute_read(&client, &request).await }
            });
            join_all(futures).await
        } else {
            let mut results = Vec::with_capacity(plan.len());
            for request in plan {
                results.push(execute_read(client, request).await);
            }
            results
        };

    stats.write().requests_sent += plan.len() as u64;

    let mut any_ok = false;
    let mut errors = Vec::new();
    for (request, outcome) in plan.iter().zip(outcomes) {
        match outcome {
            Ok(words) => {
                any_ok = true;
                distribute(interface, request, &words, stats);
            },
            Err(error) => {
                warn!(
                    slave = request.slave,
                    start = request.start,
                    length = request.length,
                    %error,
                    "Read request failed, continuing with next request"
                );
                stats.write().requests_failed += 1;
                for member in &request.members {
                    interface.emit(EngineEvent::PointError {
                        handle: member.handle,
                        direction: Direction::Receiving,
                        error: error.clone(),
                    });
                }
                errors.push(CycleError {
                    address: PointAddress {
                        slave: request.slave,
                        kind: request.kind,
                        address: request.start,
                    },
                    error,
                });
            },
        }
    }
    (any_ok, errors)
}

async fn execute_read(
    client: &Arc<dyn ProtocolClient>,
    request: &ReadRequest,
) -> Result<Vec<u16>> {
    let response = client
        .request(ClientRequest::Read {
            slave: request.slave,
            kind: request.kind,
            address: request.start,
            count: request.length,
        })
        .await?;
    match response {
        ClientResponse::ReadWords(words) if !request.kind.is_bit() => Ok(words),
        // Bit objects are cached as 0/1 words so one decode path serves both.
        ClientResponse::ReadBits(bits) if request.kind.is_bit() => {
            Ok(bits.into_iter().map(u16::from).collect())
        },
        ClientResponse::Fault(fault) => Err(PointLinkError::Fault(fault)),
        other => Err(PointLinkError::Protocol(format!(
            "Unexpected response to read: {other:?}"
        ))),
    }
}

/// Write one response into memory and refresh every member point
fn distribute(
    interface: &Interface,
    request: &ReadRequest,
    words: &[u16],
    stats: &RwLock<PollStats>,
) {
    if words.len() < usize::from(request.length) {
        warn!(
            expected = request.length,
            got = words.len(),
            "Short read response, parsing partial data"
        );
    }
    let memory = interface.memory();
    memory.write_range(request.slave, request.kind, request.start, words);

    for member in &request.members {
        let Some(point) = interface.get(member.handle) else {
            continue;
        };
        match point.receive_from_memory(memory) {
            Ok(value) => {
                stats.write().points_updated += 1;
                interface.emit(EngineEvent::ValueReceived {
                    handle: member.handle,
                    value,
                });
            },
            Err(error) => {
                interface.emit(EngineEvent::PointError {
                    handle: member.handle,
                    direction: Direction::Receiving,
                    error,
                });
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;

    use crate::client::SpanLimits;
    use crate::codec::DataFormat;
    use crate::handler::Mode;
    use crate::point::{ObjectKind, Point, PointConfig};
    use crate::value::Value;

    /// Client backed by an in-memory register bank with per-address faults
    struct BankClient {
        words: parking_lot::Mutex<HashMap<(u8, u16), u16>>,
        fail_at: Vec<u16>,
        requests: parking_lot::Mutex<Vec<ClientRequest>>,
        concurrent: bool,
    }

    impl BankClient {
        fn new() -> Self {
            Self {
                words: parking_lot::Mutex::new(HashMap::new()),
                fail_at: Vec::new(),
                requests: parking_lot::Mutex::new(Vec::new()),
                concurrent: false,
            }
        }

        fn preload(&self, slave: u8, start: u16, words: &[u16]) {
            let mut bank = self.words.lock();
            for (i, word) in words.iter().enumerate() {
                bank.insert((slave, start + i as u16), *word);
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl ProtocolClient for BankClient {
        async fn request(&self, request: ClientRequest) -> Result<ClientResponse> {
            self.requests.lock().push(request.clone());
            match request {
                ClientRequest::Read {
                    slave,
                    address,
                    count,
                    ..
                } => {
                    if self.fail_at.contains(&address) {
                        return Err(PointLinkError::Protocol("simulated timeout".into()));
                    }
                    let bank = self.words.lock();
                    let words = (0..count)
                        .map(|i| bank.get(&(slave, address + i)).copied().unwrap_or(0))
                        .collect();
                    Ok(ClientResponse::ReadWords(words))
                },
                ClientRequest::Write { .. } => Ok(ClientResponse::WriteOk),
            }
        }

        fn limits(&self) -> SpanLimits {
            SpanLimits::default()
        }

        fn supports_concurrent_requests(&self) -> bool {
            self.concurrent
        }
    }

    fn word_point(address: u16, format: DataFormat) -> Arc<Point> {
        Point::new(
            PointConfig::new(
                format!("p{address}"),
                crate::point::PointAddress {
                    slave: 1,
                    kind: ObjectKind::WordReadOnly,
                    address,
                },
                format,
            ),
            Mode::TwoWay,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_cycle_distributes_merged_read() {
        let interface = Interface::new();
        interface.bind(word_point(0, DataFormat::UInt16));
        interface.bind(word_point(1, DataFormat::UInt16));
        let p2 = word_point(2, DataFormat::Float32);
        interface.bind(Arc::clone(&p2));

        let client = Arc::new(BankClient::new());
        client.preload(1, 0, &[7, 8, 0x41BB, 0x999A]);
        let dyn_client: Arc<dyn ProtocolClient> = Arc::clone(&client) as _;

        let config = PollingConfig::default();
        let plan = plan_for_interface(&interface, &dyn_client, &config);
        assert_eq!(plan.len(), 1);
        assert_eq!((plan[0].start, plan[0].length), (0, 4));

        let stats = RwLock::new(PollStats::default());
        let (succeed, errors) =
            run_cycle(&interface, &dyn_client, &config, &plan, &stats).await;
        assert!(succeed);
        assert!(errors.is_empty());
        assert_eq!(client.request_count(), 1);
        assert_eq!(stats.read().points_updated, 3);

        match p2.handler().value() {
            Some(Value::Float(f)) => assert!((f - 23.45).abs() < 1e-4),
            other => panic!("Expected float, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_request_isolated_from_the_rest() {
        let interface = Interface::new();
        interface.bind(word_point(0, DataFormat::UInt16));
        interface.bind(word_point(1000, DataFormat::UInt16));
        interface.bind(word_point(2000, DataFormat::UInt16));

        let mut client = BankClient::new();
        client.fail_at = vec![1000, 2000];
        client.preload(1, 0, &[42]);
        let dyn_client: Arc<dyn ProtocolClient> = Arc::new(client) as _;

        let config = PollingConfig::default();
        let plan = plan_for_interface(&interface, &dyn_client, &config);
        assert_eq!(plan.len(), 3);

        let mut events = interface.subscribe();
        let stats = RwLock::new(PollStats::default());
        let (succeed, errors) =
            run_cycle(&interface, &dyn_client, &config, &plan, &stats).await;

        // One request succeeded, so the cycle still counts as a success.
        assert!(succeed);
        assert_eq!(errors.len(), 2);
        assert_eq!(stats.read().requests_failed, 2);

        let mut receive_errors = 0;
        let mut received = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::PointError {
                    direction: Direction::Receiving,
                    ..
                } => receive_errors += 1,
                EngineEvent::ValueReceived { .. } => received += 1,
                _ => {},
            }
        }
        assert_eq!(receive_errors, 2);
        assert_eq!(received, 1);
    }

    #[tokio::test]
    async fn test_parallel_requests_execute_and_distribute() {
        let interface = Interface::new();
        let points: Vec<_> = [0u16, 1000, 2000]
            .iter()
            .map(|a| {
                let p = word_point(*a, DataFormat::UInt16);
                interface.bind(Arc::clone(&p));
                p
            })
            .collect();

        let mut client = BankClient::new();
        client.concurrent = true;
        client.preload(1, 0, &[11]);
        client.preload(1, 1000, &[22]);
        client.preload(1, 2000, &[33]);
        let client = Arc::new(client);
        let dyn_client: Arc<dyn ProtocolClient> = Arc::clone(&client) as _;

        let config = PollingConfig {
            parallel_requests: true,
            ..PollingConfig::default()
        };
        let plan = plan_for_interface(&interface, &dyn_client, &config);
        assert_eq!(plan.len(), 3);

        let stats = RwLock::new(PollStats::default());
        let (succeed, errors) =
            run_cycle(&interface, &dyn_client, &config, &plan, &stats).await;
        assert!(succeed);
        assert!(errors.is_empty());

        // All three requests went out and every point got its value.
        assert_eq!(client.request_count(), 3);
        assert_eq!(stats.read().requests_sent, 3);
        assert_eq!(stats.read().points_updated, 3);
        for (point, expected) in points.iter().zip([11u64, 22, 33]) {
            assert_eq!(point.handler().value(), Some(Value::UInt(expected)));
        }
    }

    #[tokio::test]
    async fn test_send_only_points_excluded_from_plan() {
        let interface = Interface::new();
        interface.bind(word_point(0, DataFormat::UInt16));
        let send_only = Point::new(
            PointConfig::new(
                "cmd",
                crate::point::PointAddress {
                    slave: 1,
                    kind: ObjectKind::WordWritable,
                    address: 0,
                },
                DataFormat::UInt16,
            ),
            Mode::SendOnly,
        )
        .unwrap();
        interface.bind(send_only);

        let dyn_client: Arc<dyn ProtocolClient> = Arc::new(BankClient::new()) as _;
        let plan = plan_for_interface(&interface, &dyn_client, &PollingConfig::default());
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].members.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_plan_counts_as_clean_cycle() {
        let interface = Interface::new();
        let dyn_client: Arc<dyn ProtocolClient> = Arc::new(BankClient::new()) as _;
        let stats = RwLock::new(PollStats::default());
        let (succeed, errors) = run_cycle(
            &interface,
            &dyn_client,
            &PollingConfig::default(),
            &[],
            &stats,
        )
        .await;
        assert!(succeed);
        assert!(errors.is_empty());
    }

    #[tokio::test]
    async fn test_engine_start_stop_and_poll_now() {
        let interface = Interface::new();
        let point = word_point(5, DataFormat::UInt16);
        interface.bind(Arc::clone(&point));

        let client = Arc::new(BankClient::new());
        client.preload(1, 5, &[99]);
        let engine = PollEngine::new(
            interface,
            Arc::clone(&client) as Arc<dyn ProtocolClient>,
            PollingConfig {
                cycle_ms: 60_000,
                ..PollingConfig::default()
            },
        );

        engine.start().await.unwrap();
        assert!(engine.is_running());
        assert!(engine.start().await.is_err());

        // First cycle runs immediately on start.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.stats().cycles, 1);
        assert_eq!(point.handler().value(), Some(Value::UInt(99)));

        engine.poll_now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.stats().cycles, 2);

        engine.stop().await;
        assert!(!engine.is_running());
    }
}
