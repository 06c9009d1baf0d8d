//! In-process transport: paired sockets over bounded mailboxes.
//!
//! A socket pair shares two mailboxes, one per direction. The sending half
//! holds only a `Weak` to the peer's mailbox, so a dropped peer turns every
//! further send into `Disconnected` — the broker uses that as its liveness
//! probe. Each mailbox carries an optional watcher notifier; a push wakes
//! whatever monitor the receiving side registered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use thiserror::Error;

use super::signal::{Monitor, Notifier};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SocketError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("peer mailbox full")]
    MailboxFull,
}

struct Mailbox {
    /// Name of the client that reads from this mailbox.
    owner: String,
    queue: Mutex<VecDeque<Bytes>>,
    watcher: Mutex<Option<Notifier>>,
    limit: usize,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl Mailbox {
    fn new(owner: String, limit: usize) -> Self {
        Self {
            owner,
            queue: Mutex::new(VecDeque::new()),
            watcher: Mutex::new(None),
            limit,
        }
    }

    fn push(&self, frame: Bytes) -> Result<(), SocketError> {
        {
            let mut queue = lock(&self.queue);
            if queue.len() >= self.limit {
                return Err(SocketError::MailboxFull);
            }
            queue.push_back(frame);
        }
        if let Some(watcher) = lock(&self.watcher).as_ref() {
            watcher.notify("recv");
        }
        Ok(())
    }

    fn pop(&self) -> Option<Bytes> {
        lock(&self.queue).pop_front()
    }
}

/// One endpoint of an in-process connection.
pub struct Socket {
    name: String,
    inbox: Arc<Mailbox>,
    peer: Weak<Mailbox>,
}

impl Socket {
    /// Builds a connected pair. Both halves carry the same client name; the
    /// first is the client half, the second the broker half.
    pub fn pair(name: &str, limit: usize) -> (Socket, Socket) {
        let client_inbox = Arc::new(Mailbox::new(name.to_string(), limit));
        let broker_inbox = Arc::new(Mailbox::new(name.to_string(), limit));
        let client = Socket {
            name: name.to_string(),
            inbox: Arc::clone(&client_inbox),
            peer: Arc::downgrade(&broker_inbox),
        };
        let broker = Socket {
            name: name.to_string(),
            inbox: broker_inbox,
            peer: Arc::downgrade(&client_inbox),
        };
        (client, broker)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues a frame on the peer's mailbox and wakes its monitor.
    pub fn send(&self, frame: Bytes) -> Result<(), SocketError> {
        let peer = self.peer.upgrade().ok_or(SocketError::Disconnected)?;
        peer.push(frame)
    }

    pub fn recv(&self) -> Option<Bytes> {
        self.inbox.pop()
    }

    pub fn is_connected(&self) -> bool {
        self.peer.strong_count() > 0
    }

    /// Signals `recv` to `monitor` (sender = this client's name) whenever a
    /// frame arrives. Frames that landed before the monitor was attached
    /// raise an immediate signal so none are stranded.
    pub fn set_monitor(&self, monitor: &Monitor) {
        let notifier = monitor.notifier(self.inbox.owner.clone());
        let backlog = !lock(&self.inbox.queue).is_empty();
        *lock(&self.inbox.watcher) = Some(notifier.clone());
        if backlog {
            notifier.notify("recv");
        }
    }
}

/// Broker-side accept queue for one endpoint URL.
pub struct Acceptor {
    pending: Mutex<VecDeque<Socket>>,
    watcher: Mutex<Option<Notifier>>,
}

impl Acceptor {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            watcher: Mutex::new(None),
        }
    }

    /// Hands the broker half of a fresh pair to the broker thread.
    pub fn push(&self, socket: Socket) {
        lock(&self.pending).push_back(socket);
        if let Some(watcher) = lock(&self.watcher).as_ref() {
            watcher.notify("accept");
        }
    }

    pub fn accept(&self) -> Option<Socket> {
        lock(&self.pending).pop_front()
    }

    pub fn set_monitor(&self, monitor: &Monitor) {
        *lock(&self.watcher) = Some(monitor.notifier("acceptor"));
    }
}

impl Default for Acceptor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn frames_flow_both_ways_in_order() {
        let (client, broker) = Socket::pair("c0", 8);
        client.send(Bytes::from_static(b"one")).expect("send");
        client.send(Bytes::from_static(b"two")).expect("send");
        assert_eq!(broker.recv().expect("one"), Bytes::from_static(b"one"));
        assert_eq!(broker.recv().expect("two"), Bytes::from_static(b"two"));
        broker.send(Bytes::from_static(b"ack")).expect("send");
        assert_eq!(client.recv().expect("ack"), Bytes::from_static(b"ack"));
    }

    #[test]
    fn send_to_dropped_peer_fails() {
        let (client, broker) = Socket::pair("c0", 8);
        drop(broker);
        assert_eq!(
            client.send(Bytes::from_static(b"x")),
            Err(SocketError::Disconnected)
        );
        assert!(!client.is_connected());
    }

    #[test]
    fn full_mailbox_refuses_frames() {
        let (client, broker) = Socket::pair("c0", 1);
        client.send(Bytes::from_static(b"a")).expect("first fits");
        assert_eq!(
            client.send(Bytes::from_static(b"b")),
            Err(SocketError::MailboxFull)
        );
        assert_eq!(broker.recv().expect("a"), Bytes::from_static(b"a"));
        client.send(Bytes::from_static(b"b")).expect("space again");
    }

    #[test]
    fn push_wakes_receiving_monitor() {
        let (client, broker) = Socket::pair("worker", 8);
        let monitor = Monitor::new();
        broker.set_monitor(&monitor);
        client.send(Bytes::from_static(b"hi")).expect("send");
        let signal = monitor.wait(Duration::from_millis(100)).expect("signal");
        assert_eq!(signal.sender, "worker");
        assert_eq!(signal.payload, "recv");
    }

    #[test]
    fn acceptor_queues_and_signals() {
        let acceptor = Acceptor::new();
        let monitor = Monitor::new();
        acceptor.set_monitor(&monitor);
        let (_client, broker) = Socket::pair("c1", 8);
        acceptor.push(broker);
        assert_eq!(
            monitor.wait(Duration::from_millis(100)).expect("signal").payload,
            "accept"
        );
        assert_eq!(acceptor.accept().expect("socket").name(), "c1");
    }
}
