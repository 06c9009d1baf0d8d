//! Synchronous send/listen façade over the in-process broker.
//!
//! A client owns a UUID name, one socket half, and its own monitor. The
//! mailbox locks serialize concurrent `send`/`listen` from different
//! threads; no outer lock is held while blocking.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::Limits;
use crate::error::Error;
use crate::generate_uuid;
use crate::runtime::packet::{Packet, TargetKey};
use crate::runtime::signal::Monitor;
use crate::runtime::socket::{Socket, SocketError};
use crate::value::Value;

pub struct BrokerClient {
    name: String,
    monitor: Monitor,
    socket: Socket,
}

impl BrokerClient {
    /// Builds a connected client: registers a socket pair with the endpoint
    /// acceptor and completes the connect handshake.
    pub(crate) fn connect(
        url: &str,
        acceptor: &crate::runtime::socket::Acceptor,
        limits: &Limits,
    ) -> Result<Self, Error> {
        let name = generate_uuid();
        let (mine, theirs) = Socket::pair(&name, limits.mailbox_max_packets);
        let monitor = Monitor::new();
        mine.set_monitor(&monitor);
        acceptor.push(theirs);

        let client = Self {
            name,
            monitor,
            socket: mine,
        };

        let tx_id = generate_uuid();
        client.send_connect(&tx_id)?;
        let deadline = limits.connect_timeout();
        match client.listen(deadline) {
            Some(packet) if packet.kind == crate::runtime::packet::PacketKind::Respond => {
                if packet.tx_id().ok() != Some(tx_id.as_str()) {
                    return Err(Error::Connect {
                        url: url.to_string(),
                        reason: "unexpected connect ack".to_string(),
                    });
                }
                if packet.status != Some(true) {
                    let reason = packet.reason().unwrap_or("connect refused").to_string();
                    return Err(Error::Connect {
                        url: url.to_string(),
                        reason,
                    });
                }
                Ok(client)
            }
            Some(_) => Err(Error::Connect {
                url: url.to_string(),
                reason: "unexpected packet during handshake".to_string(),
            }),
            None => Err(Error::Connect {
                url: url.to_string(),
                reason: "connect ack did not arrive".to_string(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encodes and enqueues a packet on the broker's inbound queue.
    pub fn send_packet(&self, packet: &Packet) -> Result<(), Error> {
        let frame = packet.encode().map_err(|err| Error::Encode(err.to_string()))?;
        self.send_frame(frame)
    }

    /// Enqueues an already-framed packet. Bindings that pre-encode use
    /// this; the broker answers undecodable frames with `InvalidPacket`.
    pub fn send_frame(&self, frame: bytes::Bytes) -> Result<(), Error> {
        self.socket.send(frame).map_err(|err| match err {
            SocketError::Disconnected => Error::NotConnected,
            SocketError::MailboxFull => Error::MailboxFull,
        })
    }

    pub fn send_connect(&self, tx_id: &str) -> Result<(), Error> {
        self.send_packet(&Packet::connect(tx_id))
    }

    pub fn send_disconnect(&self, tx_id: &str) -> Result<(), Error> {
        self.send_packet(&Packet::disconnect(tx_id))
    }

    pub fn send_subscribe(&self, tx_id: &str, target: &TargetKey) -> Result<(), Error> {
        self.send_packet(&Packet::subscribe(tx_id, target))
    }

    pub fn send_unsubscribe(&self, tx_id: &str, target: &TargetKey) -> Result<(), Error> {
        self.send_packet(&Packet::unsubscribe(tx_id, target))
    }

    pub fn send_execute_function(&self, tx_id: &str, name: &str, input: Value) -> Result<(), Error> {
        self.send_packet(&Packet::execute_function(tx_id, name, input))
    }

    pub fn send_execute_define(
        &self,
        tx_id: &str,
        type_name: &str,
        instance: &str,
        attrs: Value,
    ) -> Result<(), Error> {
        self.send_packet(&Packet::execute_define(tx_id, type_name, instance, attrs))
    }

    pub fn send_execute_delete(&self, tx_id: &str, instance: &str) -> Result<(), Error> {
        self.send_packet(&Packet::execute_delete(tx_id, instance))
    }

    pub fn send_execute_method(
        &self,
        tx_id: &str,
        instance: &str,
        method: &str,
        input: Value,
    ) -> Result<(), Error> {
        self.send_packet(&Packet::execute_method(tx_id, instance, method, input))
    }

    pub fn send_respond_execute(
        &self,
        tx_id: &str,
        sequence: u32,
        done: bool,
        out: Value,
    ) -> Result<(), Error> {
        self.send_packet(&Packet::respond_execute(tx_id, sequence, done, out))
    }

    pub fn send_respond_execute_err(
        &self,
        tx_id: &str,
        sequence: u32,
        reason: &str,
    ) -> Result<(), Error> {
        self.send_packet(&Packet::respond_execute_err(tx_id, sequence, reason))
    }

    /// Blocks until a packet arrives or the timeout elapses. Frames that do
    /// not decode are skipped with a warning; the broker never forwards
    /// malformed frames, so these only appear under memory corruption.
    pub fn listen(&self, timeout: Duration) -> Option<Packet> {
        let deadline = Instant::now() + timeout;
        loop {
            while let Some(frame) = self.socket.recv() {
                match Packet::decode(&frame) {
                    Ok(packet) => return Some(packet),
                    Err(err) => {
                        warn!(client = %self.name, %err, "skipping undecodable frame");
                    }
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let _ = self.monitor.wait(deadline - now);
        }
    }

    /// Non-blocking variant of [`listen`](Self::listen).
    pub fn try_listen(&self) -> Option<Packet> {
        self.listen(Duration::ZERO)
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }
}

impl Drop for BrokerClient {
    fn drop(&mut self) {
        // Best-effort goodbye so the broker can purge our state promptly.
        // An abrupt drop is also safe: the broker discovers it on the next
        // forward and closes our transactions.
        let tx_id = generate_uuid();
        let _ = self.send_disconnect(&tx_id);
    }
}
