//! Shared harness for integration tests: one broker+VM per test, helpers
//! to run transactions to completion, and mock language-model
//! collaborators.

#![allow(dead_code)]

pub mod lm;

use std::sync::Arc;
use std::time::Duration;

use ailoy::{builtin_module, BrokerClient, Limits, Module, Packet, PacketKind, Runtime};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestEndpoint {
    pub runtime: Runtime,
    pub url: String,
}

impl TestEndpoint {
    /// Fresh broker + VM on a unique URL with fast ticks.
    pub fn with_modules(modules: Vec<Arc<Module>>) -> Self {
        let limits = Limits {
            broker_tick_ms: 10,
            vm_tick_ms: 10,
            ..Limits::default()
        };
        let runtime = Runtime::with_limits(limits);
        let url = format!("inproc://{}", ailoy::generate_uuid());
        runtime.broker_start(&url).expect("broker start");
        runtime.vm_start(&url, modules).expect("vm start");
        Self { runtime, url }
    }

    pub fn builtin() -> Self {
        Self::with_modules(vec![Arc::new(builtin_module())])
    }

    /// Broker only, no VM.
    pub fn broker_only() -> Self {
        let limits = Limits {
            broker_tick_ms: 10,
            vm_tick_ms: 10,
            ..Limits::default()
        };
        let runtime = Runtime::with_limits(limits);
        let url = format!("inproc://{}", ailoy::generate_uuid());
        runtime.broker_start(&url).expect("broker start");
        Self { runtime, url }
    }

    pub fn client(&self) -> BrokerClient {
        self.runtime.client(&self.url).expect("client connect")
    }
}

/// Collects the `respond_execute` stream for one transaction, through the
/// terminal packet. Broker acks (`respond`) for the same transaction are
/// skipped; an early routing nak is returned as the only element.
pub fn collect_transaction(client: &BrokerClient, tx_id: &str) -> Vec<Packet> {
    let mut packets = Vec::new();
    loop {
        let packet = client
            .listen(RECV_TIMEOUT)
            .unwrap_or_else(|| panic!("timed out waiting on tx {tx_id}"));
        if packet.tx_id().ok() != Some(tx_id) {
            continue;
        }
        match packet.kind {
            PacketKind::Respond => {
                if packet.status == Some(false) {
                    packets.push(packet);
                    return packets;
                }
            }
            PacketKind::RespondExecute => {
                let done = packet.done();
                packets.push(packet);
                if done {
                    return packets;
                }
            }
            _ => {}
        }
    }
}

/// The terminal packet of a single-shot transaction, asserting it succeeded.
pub fn expect_single_ok(packets: &[Packet]) -> &Packet {
    assert_eq!(packets.len(), 1, "expected exactly one respond_execute");
    let packet = &packets[0];
    assert_eq!(packet.kind, PacketKind::RespondExecute);
    assert_eq!(packet.status, Some(true), "reason: {:?}", packet.reason());
    assert!(packet.done());
    assert_eq!(packet.sequence, Some(0));
    packet
}
