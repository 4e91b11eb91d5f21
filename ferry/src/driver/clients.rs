//! Connected client sessions and notification delivery.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::counters::{SystemCounter, SystemCounters};
use crate::driver::commands::{ClientHello, ClientId, DriverMessage, NotificationProducer};
use crate::timing::{Duration, Micros, MonoInstant};
use crate::trace::warn;

/// Per-client session state.
struct Session {
    /// Conductor → client notification queue.
    notifications: NotificationProducer,
    /// Shared with the client; counts notifications that did not fit.
    dropped: Arc<AtomicU64>,
    /// Last time any message arrived from the client.
    last_seen: MonoInstant<Micros>,
}

pub struct ClientSessions {
    sessions: BTreeMap<ClientId, Session>,
    counters: Arc<SystemCounters>,
}

impl ClientSessions {
    #[must_use]
    pub fn new(counters: Arc<SystemCounters>) -> Self {
        Self {
            sessions: BTreeMap::new(),
            counters,
        }
    }

    /// Registers a client. Returns `false` if the id is already connected.
    pub fn accept(&mut self, hello: ClientHello, now: MonoInstant<Micros>) -> bool {
        if self.sessions.contains_key(&hello.id) {
            return false;
        }
        self.sessions.insert(
            hello.id,
            Session {
                notifications: hello.notifications,
                dropped: hello.dropped,
                last_seen: now,
            },
        );
        true
    }

    #[must_use]
    pub fn contains(&self, client: ClientId) -> bool {
        self.sessions.contains_key(&client)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Records activity from `client`.
    pub fn touch(&mut self, client: ClientId, now: MonoInstant<Micros>) {
        if let Some(session) = self.sessions.get_mut(&client) {
            session.last_seen = now;
        }
    }

    pub fn remove(&mut self, client: ClientId) -> bool {
        self.sessions.remove(&client).is_some()
    }

    /// Clients silent for longer than `timeout`, or whose queue has no reader.
    #[must_use]
    pub fn expired(&self, now: MonoInstant<Micros>, timeout: Duration<Micros>) -> Vec<(ClientId, bool)> {
        self.sessions
            .iter()
            .filter_map(|(id, s)| {
                if s.notifications.is_disconnected() {
                    Some((*id, false))
                } else if now.saturating_duration_since(s.last_seen) > timeout {
                    Some((*id, true))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Queues `msg` for `client` without blocking.
    ///
    /// A full queue drops the message and marks the drop on the client so its
    /// next poll fails. Returns `true` if the message was queued.
    pub fn send(&self, client: ClientId, msg: DriverMessage) -> bool {
        let Some(session) = self.sessions.get(&client) else {
            return false;
        };
        match session.notifications.push(msg) {
            Ok(()) => true,
            Err(msg) => {
                session.dropped.fetch_add(1, Ordering::AcqRel);
                self.counters.increment(SystemCounter::NotificationsDropped);
                warn!(client = %client, message = ?msg, "client queue full, dropping notification");
                false
            }
        }
    }

    /// Sends `msg` to every connected client, best effort.
    pub fn broadcast(&self, msg: &DriverMessage) {
        for client in self.sessions.keys() {
            self.send(*client, msg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::commands::NotificationConsumer;
    use crate::queue::spsc;

    fn connect(sessions: &mut ClientSessions) -> (ClientId, NotificationConsumer, Arc<AtomicU64>) {
        let (tx, rx) = spsc::channel();
        let id = ClientId::generate();
        let dropped = Arc::new(AtomicU64::new(0));
        assert!(sessions.accept(
            ClientHello {
                id,
                notifications: tx,
                dropped: Arc::clone(&dropped),
            },
            MonoInstant::new(0),
        ));
        (id, rx, dropped)
    }

    #[test]
    fn overflow_drops_and_counts() {
        let counters = Arc::new(SystemCounters::new());
        let mut sessions = ClientSessions::new(Arc::clone(&counters));
        let (id, rx, dropped) = connect(&mut sessions);

        let capacity = crate::driver::commands::NOTIFICATION_QUEUE_CAPACITY;
        for _ in 0..capacity {
            assert!(sessions.send(id, DriverMessage::Welcome));
        }
        assert!(!sessions.send(id, DriverMessage::Shutdown));
        assert_eq!(dropped.load(Ordering::Acquire), 1);
        assert_eq!(counters.get(SystemCounter::NotificationsDropped), 1);
        assert_eq!(counters.get(SystemCounter::Errors), 0);

        assert!(matches!(rx.pop(), Some(DriverMessage::Welcome)));
        assert!(sessions.send(id, DriverMessage::Shutdown));
    }

    #[test]
    fn expiry_by_silence_or_disconnect() {
        let mut sessions = ClientSessions::new(Arc::new(SystemCounters::new()));
        let (quiet, _quiet_rx, _) = connect(&mut sessions);
        let (gone, gone_rx, _) = connect(&mut sessions);
        let (busy, _busy_rx, _) = connect(&mut sessions);
        drop(gone_rx);

        sessions.touch(busy, MonoInstant::new(900));
        let mut expired = sessions.expired(MonoInstant::new(1_000), Duration::new(500));
        expired.sort();
        let mut want = vec![(quiet, true), (gone, false)];
        want.sort();
        assert_eq!(expired, want);
    }

    #[test]
    fn duplicate_hello_ignored() {
        let mut sessions = ClientSessions::new(Arc::new(SystemCounters::new()));
        let (id, _rx, _) = connect(&mut sessions);
        let (tx, _rx2) = spsc::channel();
        assert!(!sessions.accept(
            ClientHello {
                id,
                notifications: tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            MonoInstant::new(1),
        ));
        assert_eq!(sessions.len(), 1);
    }
}
