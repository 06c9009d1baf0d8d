//! The in-process router: one thread per endpoint URL.
//!
//! The broker owns three tables — clients, subscriptions, transactions —
//! and serializes every mutation on its own thread. Packets are framed by
//! the sender; the broker forwards original frames untouched, so per-txid
//! FIFO ordering falls out of single-threaded forwarding over FIFO
//! mailboxes.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::config::Limits;
use crate::error::ErrorCode;
use crate::runtime::packet::{Packet, PacketKind, TargetKey};
use crate::runtime::signal::{Monitor, StopFlag};
use crate::runtime::socket::{Acceptor, Socket, SocketError};

struct TxRecord {
    initiator: String,
    responder: String,
}

struct Broker {
    url: String,
    limits: Limits,
    clients: HashMap<String, Socket>,
    subscriptions: HashMap<TargetKey, String>,
    transactions: HashMap<String, TxRecord>,
}

/// Runs one broker until its stop flag raises. `ready` fires once the
/// monitor is armed, so `broker_start` returns only after the endpoint can
/// accept connections.
pub(crate) fn run(
    url: String,
    acceptor: Arc<Acceptor>,
    stop: StopFlag,
    limits: Limits,
    ready: crossbeam::channel::Sender<()>,
) {
    let monitor = Monitor::new();
    acceptor.set_monitor(&monitor);
    stop.watch(&monitor);
    let _ = ready.send(());

    let mut broker = Broker {
        url,
        limits,
        clients: HashMap::new(),
        subscriptions: HashMap::new(),
        transactions: HashMap::new(),
    };

    loop {
        let Some(signal) = monitor.wait(broker.limits.broker_tick()) else {
            if stop.is_raised() {
                break;
            }
            continue;
        };
        match signal.payload.as_str() {
            "stop" => break,
            "accept" => {
                while let Some(socket) = acceptor.accept() {
                    socket.set_monitor(&monitor);
                    debug!(url = %broker.url, client = socket.name(), "client attached");
                    broker.clients.insert(socket.name().to_string(), socket);
                }
            }
            "recv" => broker.handle_recv(&signal.sender),
            other => warn!(url = %broker.url, payload = other, "unknown signal"),
        }
    }

    if !broker.clients.is_empty() {
        warn!(
            url = %broker.url,
            remaining = broker.clients.len(),
            "broker stopping with live connections"
        );
    }
}

impl Broker {
    /// Drains every frame the sender has queued. A signal is raised per
    /// send, but monitor attachment can fold a backlog into one signal.
    fn handle_recv(&mut self, sender: &str) {
        loop {
            // Re-resolved each round: a disconnect frame removes the client.
            let Some(socket) = self.clients.get(sender) else {
                return;
            };
            let Some(frame) = socket.recv() else {
                return;
            };
            self.handle_frame(sender, frame);
        }
    }

    fn handle_frame(&mut self, sender: &str, frame: Bytes) {
        if frame.len() > self.limits.max_packet_bytes {
            warn!(url = %self.url, client = sender, len = frame.len(), "oversized frame");
            self.reply_err(sender, "", ErrorCode::InvalidPacket.as_str());
            return;
        }
        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(url = %self.url, client = sender, %err, "undecodable frame");
                self.reply_err(sender, "", ErrorCode::InvalidPacket.as_str());
                return;
            }
        };
        debug!(url = %self.url, client = sender, packet = %packet, "packet received");

        let tx_id = match packet.tx_id() {
            Ok(tx_id) => tx_id.to_string(),
            Err(err) => {
                warn!(url = %self.url, client = sender, %err, "packet without tx id");
                self.reply_err(sender, "", ErrorCode::InvalidPacket.as_str());
                return;
            }
        };

        match packet.kind {
            PacketKind::Connect => self.reply_ok(sender, &tx_id),
            PacketKind::Disconnect => {
                self.reply_ok(sender, &tx_id);
                self.purge_client(sender);
            }
            PacketKind::Subscribe => self.handle_subscribe(sender, &tx_id, &packet),
            PacketKind::Unsubscribe => self.handle_unsubscribe(sender, &tx_id, &packet),
            PacketKind::Execute => self.handle_execute(sender, &tx_id, &packet, frame),
            PacketKind::RespondExecute => self.handle_respond_execute(sender, &tx_id, &packet, frame),
            PacketKind::Respond => {
                warn!(url = %self.url, client = sender, "unexpected respond from client");
            }
        }
    }

    fn handle_subscribe(&mut self, sender: &str, tx_id: &str, packet: &Packet) {
        let key = match packet.target_key() {
            Ok(key) => key,
            Err(err) => {
                warn!(url = %self.url, client = sender, %err, "bad subscribe");
                self.reply_err(sender, tx_id, ErrorCode::InvalidPacket.as_str());
                return;
            }
        };
        if self.subscriptions.contains_key(&key) {
            self.reply_err(
                sender,
                tx_id,
                &format!("{}: {key}", ErrorCode::AlreadySubscribed),
            );
            return;
        }
        self.subscriptions.insert(key, sender.to_string());
        self.reply_ok(sender, tx_id);
    }

    fn handle_unsubscribe(&mut self, sender: &str, tx_id: &str, packet: &Packet) {
        let key = match packet.target_key() {
            Ok(key) => key,
            Err(err) => {
                warn!(url = %self.url, client = sender, %err, "bad unsubscribe");
                self.reply_err(sender, tx_id, ErrorCode::InvalidPacket.as_str());
                return;
            }
        };
        match self.subscriptions.get(&key) {
            None => {
                self.reply_err(
                    sender,
                    tx_id,
                    &format!("{}: {key}", ErrorCode::NoSubscriber),
                );
            }
            Some(owner) if owner != sender => {
                self.reply_err(
                    sender,
                    tx_id,
                    &format!("subscription {key} is owned by another client"),
                );
            }
            Some(_) => {
                self.subscriptions.remove(&key);
                self.reply_ok(sender, tx_id);
            }
        }
    }

    fn handle_execute(&mut self, sender: &str, tx_id: &str, packet: &Packet, frame: Bytes) {
        let key = match packet.target_key() {
            Ok(key) => key,
            Err(err) => {
                warn!(url = %self.url, client = sender, %err, "bad execute");
                self.reply_err(sender, tx_id, ErrorCode::InvalidPacket.as_str());
                return;
            }
        };
        let Some(responder) = self.subscriptions.get(&key).cloned() else {
            self.reply_err(
                sender,
                tx_id,
                &format!("{}: {key}", ErrorCode::NoSubscriber),
            );
            return;
        };
        match self.forward(&responder, frame) {
            Ok(()) => {
                self.transactions.insert(
                    tx_id.to_string(),
                    TxRecord {
                        initiator: sender.to_string(),
                        responder,
                    },
                );
                self.reply_ok(sender, tx_id);
            }
            Err(SocketError::MailboxFull) => {
                // A busy responder is not a dead one; refuse this routing
                // attempt only.
                debug!(url = %self.url, responder = %responder, "responder mailbox full");
                self.reply_err(sender, tx_id, &format!("{}: {key}", ErrorCode::NoSubscriber));
            }
            Err(SocketError::Disconnected) => {
                debug!(url = %self.url, responder = %responder, "responder unreachable");
                self.drop_client(&responder);
                self.reply_err(sender, tx_id, ErrorCode::ClientGone.as_str());
            }
        }
    }

    fn handle_respond_execute(&mut self, sender: &str, tx_id: &str, packet: &Packet, frame: Bytes) {
        let Some(record) = self.transactions.get(tx_id) else {
            self.reply_err(sender, tx_id, ErrorCode::UnknownTransaction.as_str());
            return;
        };
        let initiator = record.initiator.clone();
        let terminal = packet.done();
        match self.forward(&initiator, frame) {
            Ok(()) => {
                if terminal {
                    self.transactions.remove(tx_id);
                }
            }
            Err(err) => {
                debug!(url = %self.url, initiator = %initiator, %err, "initiator unreachable");
                self.transactions.remove(tx_id);
                self.drop_client(&initiator);
                self.reply_err(sender, tx_id, ErrorCode::ClientGone.as_str());
            }
        }
    }

    fn forward(&self, to: &str, frame: Bytes) -> Result<(), SocketError> {
        let socket = self.clients.get(to).ok_or(SocketError::Disconnected)?;
        socket.send(frame)
    }

    fn reply_ok(&self, to: &str, tx_id: &str) {
        self.reply(to, Packet::respond_ok(tx_id));
    }

    fn reply_err(&self, to: &str, tx_id: &str, reason: &str) {
        self.reply(to, Packet::respond_err(tx_id, reason));
    }

    fn reply(&self, to: &str, packet: Packet) {
        let Some(socket) = self.clients.get(to) else {
            return;
        };
        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(url = %self.url, %err, "reply encode failed");
                return;
            }
        };
        if let Err(err) = socket.send(frame) {
            debug!(url = %self.url, client = to, %err, "reply dropped");
        }
    }

    /// Removes a client that announced `disconnect`: its subscriptions go,
    /// transactions it initiated close silently, transactions it was serving
    /// close with `ClientGone` toward the initiator.
    fn purge_client(&mut self, name: &str) {
        self.subscriptions.retain(|_, owner| owner != name);
        let mut gone = Vec::new();
        self.transactions.retain(|tx_id, record| {
            if record.initiator == name {
                return false;
            }
            if record.responder == name {
                gone.push((tx_id.clone(), record.initiator.clone()));
                return false;
            }
            true
        });
        for (tx_id, initiator) in gone {
            let reason = ErrorCode::ClientGone.as_str();
            self.reply(&initiator, Packet::respond_execute_err(&tx_id, 0, reason));
        }
        self.clients.remove(name);
    }

    /// Removes a client discovered dead mid-forward (no disconnect packet).
    fn drop_client(&mut self, name: &str) {
        if self.clients.contains_key(name) {
            self.purge_client(name);
        }
    }
}
