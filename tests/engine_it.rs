//! End-to-end engine tests over a simulated device
//!
//! Covers the full data path with a register-bank protocol client:
//! - write then poll back a scaled float value
//! - merged reads across several points
//! - binding rollback on a deterministically failing send
//! - cancellation before dispatch

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use voltage_pointlink::{
    bind_table, build_bound_point, CellTarget, ClientRequest, ClientResponse, DataFormat,
    Interface, Mode, ObjectKind, Point, PointAddress, PointConfig, PointLinkError, PointSpec,
    PollEngine, PollingConfig, ProtocolClient, Result, Value, WritePayload,
};

/// Protocol client backed by an in-memory register bank
struct SimulatedDevice {
    bank: parking_lot::Mutex<HashMap<(u8, u16), u16>>,
    log: parking_lot::Mutex<Vec<ClientRequest>>,
    fail_writes: bool,
}

impl SimulatedDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bank: parking_lot::Mutex::new(HashMap::new()),
            log: parking_lot::Mutex::new(Vec::new()),
            fail_writes: false,
        })
    }

    fn failing_writes() -> Arc<Self> {
        Arc::new(Self {
            bank: parking_lot::Mutex::new(HashMap::new()),
            log: parking_lot::Mutex::new(Vec::new()),
            fail_writes: true,
        })
    }

    /// Every request seen, reads included
    fn requests(&self) -> Vec<ClientRequest> {
        self.log.lock().clone()
    }

    fn write_requests(&self) -> Vec<ClientRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| matches!(r, ClientRequest::Write { .. }))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ProtocolClient for SimulatedDevice {
    async fn request(&self, request: ClientRequest) -> Result<ClientResponse> {
        self.log.lock().push(request.clone());
        match request {
            ClientRequest::Read {
                slave,
                address,
                count,
                ..
            } => {
                let bank = self.bank.lock();
                let words = (0..count)
                    .map(|i| bank.get(&(slave, address + i)).copied().unwrap_or(0))
                    .collect();
                Ok(ClientResponse::ReadWords(words))
            },
            ClientRequest::Write {
                slave,
                address,
                ref payload,
                ..
            } => {
                if self.fail_writes {
                    return Ok(ClientResponse::Fault("illegal data address".into()));
                }
                let words: Vec<u16> = match payload {
                    WritePayload::Words(words) => words.clone(),
                    WritePayload::Bits(bits) => bits.iter().map(|b| u16::from(*b)).collect(),
                };
                let mut bank = self.bank.lock();
                for (i, word) in words.iter().enumerate() {
                    bank.insert((slave, address + i as u16), *word);
                }
                Ok(ClientResponse::WriteOk)
            },
        }
    }
}

fn float_point(address: u16) -> Arc<Point> {
    Point::new(
        PointConfig::new(
            format!("f{address}"),
            PointAddress {
                slave: 1,
                kind: ObjectKind::WordWritable,
                address,
            },
            DataFormat::Float32,
        ),
        Mode::TwoWay,
    )
    .unwrap()
}

#[tokio::test]
async fn test_float32_write_then_read_back() {
    let device = SimulatedDevice::new();
    let client: Arc<dyn ProtocolClient> = Arc::clone(&device) as _;

    let interface = Interface::new();
    let point = float_point(400);
    let handle = interface.bind(Arc::clone(&point));

    interface
        .send_value(handle, &client, &Value::Float(23.45))
        .await
        .unwrap();

    // Exactly one write request of 2 registers.
    let writes = device.write_requests();
    assert_eq!(writes.len(), 1);
    match &writes[0] {
        ClientRequest::Write {
            address,
            payload: WritePayload::Words(words),
            ..
        } => {
            assert_eq!(*address, 400);
            assert_eq!(words.len(), 2);
        },
        other => panic!("Expected a word write, got {other:?}"),
    }

    // A fresh interface polling the same device reads the value back.
    let reader = Interface::new();
    let mirror = float_point(400);
    reader.bind(Arc::clone(&mirror));
    let engine = PollEngine::new(
        reader,
        Arc::clone(&client),
        PollingConfig {
            cycle_ms: 60_000,
            ..PollingConfig::default()
        },
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.stop().await;

    match mirror.handler().value() {
        Some(Value::Float(f)) => assert!((f - 23.45).abs() < 1e-4),
        other => panic!("Expected float, got {other:?}"),
    }
}

#[tokio::test]
async fn test_poll_cycle_merges_point_table() {
    let device = SimulatedDevice::new();
    {
        let mut bank = device.bank.lock();
        for address in 0..8u16 {
            bank.insert((1, address), address * 10);
        }
    }
    let client: Arc<dyn ProtocolClient> = Arc::clone(&device) as _;

    let specs: Vec<PointSpec> = (0..8)
        .map(|address| {
            serde_json::from_value(serde_json::json!({
                "name": format!("r{address}"),
                "kind": "word_read_only",
                "address": address,
                "data_type": "uint16"
            }))
            .unwrap()
        })
        .collect();

    let interface = Interface::new();
    let handles = bind_table(&interface, &specs).unwrap();

    let engine = PollEngine::new(
        interface.clone(),
        client,
        PollingConfig {
            cycle_ms: 60_000,
            ..PollingConfig::default()
        },
    );
    engine.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.stop().await;

    // Eight contiguous points, one merged request.
    let stats = engine.stats();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.points_updated, 8);

    for (i, handle) in handles.iter().enumerate() {
        let point = interface.get(*handle).unwrap();
        assert_eq!(point.handler().value(), Some(Value::UInt(i as u64 * 10)));
    }
}

#[tokio::test]
async fn test_rollback_restores_member_on_failed_send() {
    let device = SimulatedDevice::failing_writes();
    let client: Arc<dyn ProtocolClient> = Arc::clone(&device) as _;

    let spec: PointSpec = serde_json::from_value(serde_json::json!({
        "name": "setpoint",
        "kind": "word_writable",
        "address": 10,
        "data_type": "uint16",
        "rollback_on_error": true
    }))
    .unwrap();
    let target = CellTarget::new(Value::UInt(100));
    let point = build_bound_point(&spec, Arc::clone(&target) as _).unwrap();

    let interface = Interface::new();
    let handle = interface.bind(point);

    let result = interface
        .push_binding(handle, &client, &Value::UInt(250))
        .await;
    assert!(matches!(result, Err(PointLinkError::Fault(_))));

    // The member is back at its pre-change value.
    assert_eq!(target.get(), Value::UInt(100));
}

#[tokio::test]
async fn test_cancelled_send_never_reaches_the_device() {
    let device = SimulatedDevice::new();
    let client: Arc<dyn ProtocolClient> = Arc::clone(&device) as _;

    let point = float_point(0);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let memory = voltage_pointlink::DeviceMemory::new();
    let result = point
        .send_cancellable(&client, &memory, &Value::Float(1.0), cancel)
        .await;
    assert!(matches!(result, Err(PointLinkError::Cancelled)));
    assert!(device.requests().is_empty());
}

#[tokio::test]
async fn test_cancelled_read_modify_write_skips_the_readback() {
    // A bit-flag write on a cold cache reads the current register back
    // first; even that read must not happen once the token is cancelled.
    let device = SimulatedDevice::new();
    let client: Arc<dyn ProtocolClient> = Arc::clone(&device) as _;

    let point = Point::new(
        PointConfig::new(
            "alarm_ack",
            PointAddress {
                slave: 1,
                kind: ObjectKind::WordWritable,
                address: 10,
            },
            DataFormat::Bool { bit: 3 },
        ),
        Mode::TwoWay,
    )
    .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let memory = voltage_pointlink::DeviceMemory::new();
    let result = point
        .send_cancellable(&client, &memory, &Value::Bool(true), cancel)
        .await;
    assert!(matches!(result, Err(PointLinkError::Cancelled)));
    assert!(device.requests().is_empty());
}
