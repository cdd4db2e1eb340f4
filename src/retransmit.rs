//! Ownership of outbound confirmable messages until they are acknowledged.
//!
//! The scheduler itself is synchronous: the endpoint arms one timer task per
//! pending message and reports expiries back through [`on_timer`]. Expiries,
//! acknowledgements and cancellations all go through the same `&mut self`,
//! so exactly one of them wins for any message.
//!
//! [`on_timer`]: RetransmissionScheduler::on_timer

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, trace};
use rand::Rng;
use tokio::task::AbortHandle;

use crate::config::TransmissionParameters;
use crate::message::Message;

/// Who sent a confirmable message, so expiry can be reported to them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    /// A client request, correlated by token.
    Request { token: Vec<u8> },
    /// A server notification to an observer.
    Notification { path: String, token: Vec<u8> },
    /// A separate response sent by the server.
    Response,
}

/// A confirmable message waiting for an NSTART slot.
#[derive(Debug, Clone)]
pub struct Queued {
    pub message: Message,
    pub origin: Origin,
}

#[derive(Debug)]
struct Pending {
    datagram: Bytes,
    timeout: Duration,
    transmissions: u32,
    origin: Origin,
    generation: u64,
    timer: Option<AbortHandle>,
}

#[derive(Debug, PartialEq)]
pub enum TimerOutcome {
    Retransmit {
        datagram: Bytes,
        next_timeout: Duration,
        attempt: u32,
        origin: Origin,
    },
    /// All retransmissions were used up; the entry is gone.
    Exhausted { origin: Origin },
    /// The message was acknowledged or cancelled in the meantime.
    Stale,
}

#[derive(Debug)]
pub struct RetransmissionScheduler {
    params: TransmissionParameters,
    pending: HashMap<(SocketAddr, u16), Pending>,
    outstanding: HashMap<SocketAddr, usize>,
    queued: HashMap<SocketAddr, VecDeque<Queued>>,
    next_generation: u64,
}

impl RetransmissionScheduler {
    pub fn new(params: TransmissionParameters) -> Self {
        Self {
            params,
            pending: HashMap::new(),
            outstanding: HashMap::new(),
            queued: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Draws the first timeout uniformly from `[ACK_TIMEOUT, ACK_TIMEOUT * ACK_RANDOM_FACTOR]`.
    pub fn initial_timeout<R: Rng>(&self, rng: &mut R) -> Duration {
        let low = self.params.ack_timeout;
        let high = self.params.max_initial_timeout();
        if high <= low {
            return low;
        }
        rng.gen_range(low..=high)
    }

    /// Whether another confirmable message may be sent to `peer` right now.
    pub fn has_capacity(&self, peer: &SocketAddr) -> bool {
        self.outstanding.get(peer).copied().unwrap_or(0) < self.params.nstart
    }

    pub fn enqueue(&mut self, peer: SocketAddr, queued: Queued) {
        debug!("NSTART reached for {}, queueing {:?}", peer, queued.origin);
        self.queued.entry(peer).or_default().push_back(queued);
    }

    /// Takes the next queued message for `peer` if a slot is free.
    pub fn dequeue(&mut self, peer: &SocketAddr) -> Option<Queued> {
        if !self.has_capacity(peer) {
            return None;
        }
        let queue = self.queued.get_mut(peer)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queued.remove(peer);
        }
        next
    }

    /// Drops queued messages belonging to `origin`. Returns true if any was removed.
    pub fn remove_queued(&mut self, peer: &SocketAddr, origin: &Origin) -> bool {
        let Some(queue) = self.queued.get_mut(peer) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|q| q.origin != *origin);
        let removed = queue.len() != before;
        if queue.is_empty() {
            self.queued.remove(peer);
        }
        removed
    }

    /// Takes ownership of a transmitted confirmable message. Returns the
    /// generation to hand back to [`on_timer`](Self::on_timer).
    pub fn register(
        &mut self,
        peer: SocketAddr,
        message_id: u16,
        datagram: Bytes,
        timeout: Duration,
        origin: Origin,
    ) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;

        let previous = self.pending.insert(
            (peer, message_id),
            Pending {
                datagram,
                timeout,
                transmissions: 1,
                origin,
                generation,
                timer: None,
            },
        );
        match previous {
            Some(previous) => {
                if let Some(timer) = previous.timer {
                    timer.abort();
                }
            }
            None => *self.outstanding.entry(peer).or_insert(0) += 1,
        }
        generation
    }

    pub fn attach_timer(&mut self, peer: SocketAddr, message_id: u16, timer: AbortHandle) {
        match self.pending.get_mut(&(peer, message_id)) {
            Some(pending) => pending.timer = Some(timer),
            None => timer.abort(),
        }
    }

    pub fn on_timer(&mut self, peer: SocketAddr, message_id: u16, generation: u64) -> TimerOutcome {
        let key = (peer, message_id);
        let exhausted = match self.pending.get_mut(&key) {
            Some(pending) if pending.generation == generation => {
                if pending.transmissions > self.params.max_retransmit {
                    true
                } else {
                    pending.transmissions += 1;
                    pending.timeout *= 2;
                    trace!(
                        "retransmitting {} to {} (attempt {})",
                        message_id,
                        peer,
                        pending.transmissions - 1
                    );
                    return TimerOutcome::Retransmit {
                        datagram: pending.datagram.clone(),
                        next_timeout: pending.timeout,
                        attempt: pending.transmissions - 1,
                        origin: pending.origin.clone(),
                    };
                }
            }
            _ => false,
        };

        if !exhausted {
            return TimerOutcome::Stale;
        }
        match self.remove(&key) {
            Some(pending) => {
                debug!("message {} to {} exhausted its retransmissions", message_id, peer);
                TimerOutcome::Exhausted {
                    origin: pending.origin,
                }
            }
            None => TimerOutcome::Stale,
        }
    }

    /// Stops retransmitting a message that was acknowledged, reset or
    /// answered. Returns its origin if it was still pending.
    pub fn acknowledge(&mut self, peer: SocketAddr, message_id: u16) -> Option<Origin> {
        let pending = self.remove(&(peer, message_id))?;
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        Some(pending.origin)
    }

    pub fn is_pending(&self, peer: &SocketAddr, message_id: u16) -> bool {
        self.pending.contains_key(&(*peer, message_id))
    }

    /// Aborts every timer. Used on shutdown.
    pub fn clear(&mut self) {
        for (_, pending) in self.pending.drain() {
            if let Some(timer) = pending.timer {
                timer.abort();
            }
        }
        self.outstanding.clear();
        self.queued.clear();
    }

    fn remove(&mut self, key: &(SocketAddr, u16)) -> Option<Pending> {
        let pending = self.pending.remove(key)?;
        if let Some(count) = self.outstanding.get_mut(&key.0) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.outstanding.remove(&key.0);
            }
        }
        Some(pending)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MessageExt, MessageType, Method};

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn request_origin() -> Origin {
        Origin::Request {
            token: vec![1, 2],
        }
    }

    #[test]
    fn test_initial_timeout_range() {
        let scheduler = RetransmissionScheduler::new(TransmissionParameters::default());
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let timeout = scheduler.initial_timeout(&mut rng);
            assert!(timeout >= Duration::from_secs(2));
            assert!(timeout <= Duration::from_secs(3));
        }
    }

    #[test]
    fn test_backoff_until_exhausted() {
        let mut scheduler = RetransmissionScheduler::new(TransmissionParameters::default());
        let initial = Duration::from_millis(2500);
        let generation = scheduler.register(
            peer(),
            10,
            Bytes::from_static(b"con"),
            initial,
            request_origin(),
        );

        let mut expected_timeout = initial;
        for attempt in 1..=4 {
            expected_timeout *= 2;
            match scheduler.on_timer(peer(), 10, generation) {
                TimerOutcome::Retransmit {
                    next_timeout,
                    attempt: a,
                    datagram,
                    ..
                } => {
                    assert_eq!(a, attempt);
                    assert_eq!(next_timeout, expected_timeout);
                    assert_eq!(&datagram[..], b"con");
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            scheduler.on_timer(peer(), 10, generation),
            TimerOutcome::Exhausted {
                origin: request_origin()
            }
        );
        assert_eq!(scheduler.on_timer(peer(), 10, generation), TimerOutcome::Stale);
        assert!(scheduler.has_capacity(&peer()));
    }

    #[test]
    fn test_acknowledge_wins_over_timer() {
        let mut scheduler = RetransmissionScheduler::new(TransmissionParameters::default());
        let generation =
            scheduler.register(peer(), 3, Bytes::new(), Duration::from_secs(2), request_origin());
        assert_eq!(scheduler.acknowledge(peer(), 3), Some(request_origin()));
        assert_eq!(scheduler.acknowledge(peer(), 3), None);
        assert_eq!(scheduler.on_timer(peer(), 3, generation), TimerOutcome::Stale);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let mut scheduler = RetransmissionScheduler::new(TransmissionParameters::default());
        let old = scheduler.register(peer(), 3, Bytes::new(), Duration::from_secs(2), request_origin());
        scheduler.acknowledge(peer(), 3);
        let new = scheduler.register(peer(), 3, Bytes::new(), Duration::from_secs(2), Origin::Response);
        assert_ne!(old, new);
        assert_eq!(scheduler.on_timer(peer(), 3, old), TimerOutcome::Stale);
        assert!(scheduler.is_pending(&peer(), 3));
    }

    #[test]
    fn test_nstart_queue() {
        let mut scheduler = RetransmissionScheduler::new(TransmissionParameters::default());
        scheduler.register(peer(), 1, Bytes::new(), Duration::from_secs(2), request_origin());
        assert!(!scheduler.has_capacity(&peer()));

        let queued = Queued {
            message: Message::request(Method::Get, MessageType::Confirmable),
            origin: Origin::Request { token: vec![9] },
        };
        scheduler.enqueue(peer(), queued);
        assert!(scheduler.dequeue(&peer()).is_none());

        scheduler.acknowledge(peer(), 1);
        let next = scheduler.dequeue(&peer()).unwrap();
        assert_eq!(next.origin, Origin::Request { token: vec![9] });
        assert!(scheduler.dequeue(&peer()).is_none());
    }

    #[test]
    fn test_remove_queued() {
        let mut scheduler = RetransmissionScheduler::new(TransmissionParameters::default());
        let origin = Origin::Request { token: vec![9] };
        scheduler.enqueue(
            peer(),
            Queued {
                message: Message::request(Method::Get, MessageType::Confirmable),
                origin: origin.clone(),
            },
        );
        assert!(scheduler.remove_queued(&peer(), &origin));
        assert!(!scheduler.remove_queued(&peer(), &origin));
    }
}
