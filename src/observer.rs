//! Observe (RFC 7641) bookkeeping for both roles.
//!
//! Server side, [`ObserveRegistry`] tracks who observes which resource and the
//! per-resource notification sequence. Client side, [`ObservationTable`]
//! remembers the newest notification accepted for every observation and
//! filters reordered or duplicated ones with [`is_fresher`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use log::debug;

use crate::message::{Message, OBSERVE_SEQUENCE_MASK};

/// Half of the 24-bit sequence space.
pub const FRESHNESS_THRESHOLD: u32 = 1 << 23;

/// After this many milliseconds a sequence number that looks old is more
/// likely to have wrapped around than to have been reordered.
pub const REORDERING_WINDOW_MS: u64 = 128_000;

/// Decides whether the notification `(v2, t2)` is newer than the stored
/// `(v1, t1)`. Sequence numbers are taken modulo 2^24, timestamps are in
/// milliseconds.
pub fn is_fresher(v1: u32, t1: u64, v2: u32, t2: u64) -> bool {
    let delta = v2.wrapping_sub(v1) & OBSERVE_SEQUENCE_MASK;
    if delta == 0 {
        return false;
    }
    delta < FRESHNESS_THRESHOLD || t2 > t1.saturating_add(REORDERING_WINDOW_MS)
}

#[derive(Debug)]
struct ResourceItem {
    /// Registering request per `(peer, token)`, replayed to build notifications.
    observers: HashMap<(SocketAddr, Vec<u8>), Message>,
    sequence: u32,
}

impl ResourceItem {
    fn new() -> Self {
        Self {
            observers: HashMap::new(),
            sequence: 0,
        }
    }
}

#[derive(Debug)]
struct NotificationItem {
    path: String,
    token: Vec<u8>,
    sent: Instant,
}

/// A notification to push after a resource changed.
#[derive(Debug, Clone)]
pub struct PendingNotification {
    pub peer: SocketAddr,
    pub request: Message,
    pub sequence: u32,
}

/// Server-side observer sets.
#[derive(Debug)]
pub struct ObserveRegistry {
    resources: HashMap<String, ResourceItem>,
    notifications: HashMap<(SocketAddr, u16), NotificationItem>,
    lifetime: Duration,
}

impl ObserveRegistry {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            resources: HashMap::new(),
            notifications: HashMap::new(),
            lifetime,
        }
    }

    /// Adds (or refreshes) an observer and returns the sequence number the
    /// registration response carries.
    pub fn register(&mut self, path: &str, peer: SocketAddr, request: &Message) -> u32 {
        debug!("register {} {}", peer, path);

        let resource = self
            .resources
            .entry(path.to_string())
            .or_insert_with(ResourceItem::new);
        resource
            .observers
            .insert((peer, request.get_token().to_vec()), request.clone());
        resource.sequence
    }

    pub fn deregister(&mut self, path: &str, peer: SocketAddr, token: &[u8]) -> bool {
        debug!("deregister {} {}", peer, path);

        match self.resources.get_mut(path) {
            Some(resource) => resource
                .observers
                .remove(&(peer, token.to_vec()))
                .is_some(),
            None => false,
        }
    }

    pub fn is_observing(&self, path: &str, peer: SocketAddr, token: &[u8]) -> bool {
        self.resources
            .get(path)
            .map_or(false, |r| r.observers.contains_key(&(peer, token.to_vec())))
    }

    pub fn observer_count(&self, path: &str) -> usize {
        self.resources.get(path).map_or(0, |r| r.observers.len())
    }

    pub fn sequence(&self, path: &str) -> u32 {
        self.resources.get(path).map_or(0, |r| r.sequence)
    }

    /// Bumps the resource's sequence number (mod 2^24) and lists the
    /// notifications to push.
    pub fn resource_changed(&mut self, path: &str) -> Vec<PendingNotification> {
        let resource = self
            .resources
            .entry(path.to_string())
            .or_insert_with(ResourceItem::new);
        resource.sequence = (resource.sequence + 1) & OBSERVE_SEQUENCE_MASK;
        let sequence = resource.sequence;

        debug!(
            "resource_changed {} seq {} ({} observers)",
            path,
            sequence,
            resource.observers.len()
        );

        resource
            .observers
            .iter()
            .map(|((peer, _), request)| PendingNotification {
                peer: *peer,
                request: request.clone(),
                sequence,
            })
            .collect()
    }

    /// Remembers which observer a notification went to, so a Reset for it
    /// can be traced back.
    pub fn record_notification(
        &mut self,
        peer: SocketAddr,
        message_id: u16,
        path: &str,
        token: &[u8],
        now: Instant,
    ) {
        self.notifications.insert(
            (peer, message_id),
            NotificationItem {
                path: path.to_string(),
                token: token.to_vec(),
                sent: now,
            },
        );
    }

    /// Handles a Reset answering a notification. Returns true if an observer
    /// was removed.
    pub fn reset_received(&mut self, peer: SocketAddr, message_id: u16) -> bool {
        match self.notifications.remove(&(peer, message_id)) {
            Some(item) => self.deregister(&item.path, peer, &item.token),
            None => false,
        }
    }

    pub fn prune(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        self.notifications
            .retain(|_, item| now.duration_since(item.sent) < lifetime);
        self.resources
            .retain(|_, resource| !resource.observers.is_empty() || resource.sequence != 0);
    }
}

/// Client-side lifecycle of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationState {
    Active,
    Cancelled,
}

#[derive(Debug)]
struct ObservationRecord {
    latest: Option<(u32, u64)>,
    lazily_cancelled: bool,
}

/// What to do with a notification for an active observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Newer than anything seen so far: deliver it.
    Accept,
    /// Reordered or duplicated: acknowledge but do not deliver.
    Stale,
    /// The observation was lazily cancelled: answer with a Reset. The record is gone.
    Reject,
}

/// Client-side observation records keyed by `(peer, token)`.
#[derive(Debug, Default)]
pub struct ObservationTable {
    records: HashMap<(SocketAddr, Vec<u8>), ObservationRecord>,
}

impl ObservationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: SocketAddr, token: &[u8]) -> bool {
        match self.records.entry((peer, token.to_vec())) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(ObservationRecord {
                    latest: None,
                    lazily_cancelled: false,
                });
                true
            }
        }
    }

    pub fn state(&self, peer: SocketAddr, token: &[u8]) -> ObservationState {
        if self.records.contains_key(&(peer, token.to_vec())) {
            ObservationState::Active
        } else {
            ObservationState::Cancelled
        }
    }

    /// Applies the freshness check. Returns `None` when there is no such
    /// observation.
    pub fn on_notification(
        &mut self,
        peer: SocketAddr,
        token: &[u8],
        sequence: u32,
        received_ms: u64,
    ) -> Option<Verdict> {
        let key = (peer, token.to_vec());
        let record = self.records.get_mut(&key)?;

        if record.lazily_cancelled {
            self.records.remove(&key);
            return Some(Verdict::Reject);
        }

        let fresher = match record.latest {
            None => true,
            Some((v1, t1)) => is_fresher(v1, t1, sequence, received_ms),
        };
        if fresher {
            record.latest = Some((sequence & OBSERVE_SEQUENCE_MASK, received_ms));
            Some(Verdict::Accept)
        } else {
            debug!("dropping stale notification {} from {}", sequence, peer);
            Some(Verdict::Stale)
        }
    }

    /// Marks the observation so the next notification is answered with Reset.
    pub fn cancel_lazily(&mut self, peer: SocketAddr, token: &[u8]) -> bool {
        match self.records.get_mut(&(peer, token.to_vec())) {
            Some(record) => {
                record.lazily_cancelled = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, peer: SocketAddr, token: &[u8]) -> bool {
        self.records.remove(&(peer, token.to_vec())).is_some()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MessageExt, MessageType, Method};

    const T: u64 = 12345;

    #[test]
    fn test_freshness_vectors() {
        let threshold = FRESHNESS_THRESHOLD;
        assert!(is_fresher(1, T, threshold, T));
        assert!(!is_fresher(threshold, T, 2 * threshold, T));
        assert!(!is_fresher(threshold, T, 2 * threshold, T + 128000));
        assert!(is_fresher(threshold, T, 2 * threshold, T + 128001));
        assert!(!is_fresher(threshold + 1, T - 1, 1, T));
        assert!(is_fresher(threshold + 1, T - 1, 1, T + 128001));
    }

    #[test]
    fn test_equal_sequence_is_never_fresher() {
        assert!(!is_fresher(42, T, 42, T));
        assert!(!is_fresher(42, T, 42, T + 10 * REORDERING_WINDOW_MS));
    }

    #[test]
    fn test_wraparound_is_fresher() {
        assert!(is_fresher(OBSERVE_SEQUENCE_MASK, T, 0, T));
        assert!(is_fresher(OBSERVE_SEQUENCE_MASK - 3, T, 2, T));
        assert!(!is_fresher(2, T, OBSERVE_SEQUENCE_MASK - 3, T));
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn test_observation_filters_stale() {
        let mut table = ObservationTable::new();
        assert!(table.insert(peer(), b"tk"));
        assert!(!table.insert(peer(), b"tk"));

        assert_eq!(table.on_notification(peer(), b"tk", 5, T), Some(Verdict::Accept));
        assert_eq!(table.on_notification(peer(), b"tk", 7, T + 1), Some(Verdict::Accept));
        assert_eq!(table.on_notification(peer(), b"tk", 6, T + 2), Some(Verdict::Stale));
        assert_eq!(table.on_notification(peer(), b"tk", 7, T + 3), Some(Verdict::Stale));
        assert_eq!(table.on_notification(peer(), b"other", 8, T), None);
    }

    #[test]
    fn test_lazy_cancel_rejects_next_notification() {
        let mut table = ObservationTable::new();
        table.insert(peer(), b"tk");
        table.on_notification(peer(), b"tk", 1, T);
        assert!(table.cancel_lazily(peer(), b"tk"));
        assert_eq!(table.state(peer(), b"tk"), ObservationState::Active);

        assert_eq!(table.on_notification(peer(), b"tk", 2, T + 1), Some(Verdict::Reject));
        assert_eq!(table.state(peer(), b"tk"), ObservationState::Cancelled);
        assert_eq!(table.on_notification(peer(), b"tk", 3, T + 2), None);
    }

    fn observe_request(token: &[u8]) -> Message {
        let mut request = Message::request(Method::Get, MessageType::Confirmable);
        request.set_token(token.to_vec());
        request.set_path("/test");
        request.set_observe_value(0);
        request
    }

    #[test]
    fn test_register_and_notify() {
        let mut registry = ObserveRegistry::new(Duration::from_secs(247));
        assert_eq!(registry.register("test", peer(), &observe_request(b"a")), 0);
        registry.register("test", peer(), &observe_request(b"b"));
        assert_eq!(registry.observer_count("test"), 2);

        let pushes = registry.resource_changed("test");
        assert_eq!(pushes.len(), 2);
        assert!(pushes.iter().all(|p| p.sequence == 1));
        assert_eq!(registry.sequence("test"), 1);

        assert!(registry.deregister("test", peer(), b"a"));
        assert!(!registry.deregister("test", peer(), b"a"));
        assert_eq!(registry.resource_changed("test").len(), 1);
    }

    #[test]
    fn test_sequence_wraps_at_24_bits() {
        let mut registry = ObserveRegistry::new(Duration::from_secs(247));
        registry.register("test", peer(), &observe_request(b"a"));
        registry.resources.get_mut("test").unwrap().sequence = OBSERVE_SEQUENCE_MASK;
        let pushes = registry.resource_changed("test");
        assert_eq!(pushes[0].sequence, 0);
    }

    #[test]
    fn test_reset_removes_observer() {
        let now = Instant::now();
        let mut registry = ObserveRegistry::new(Duration::from_secs(247));
        registry.register("test", peer(), &observe_request(b"a"));
        registry.record_notification(peer(), 99, "test", b"a", now);

        assert!(registry.reset_received(peer(), 99));
        assert!(!registry.is_observing("test", peer(), b"a"));
        assert!(!registry.reset_received(peer(), 99));
    }
}
