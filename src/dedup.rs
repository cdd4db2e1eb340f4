//! Detection of repeated inbound messages.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::message::Message;

#[derive(Debug)]
struct DedupEntry {
    reply: Option<Message>,
    inserted: Instant,
}

/// What to do with an inbound CON or NON message.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// First time we see it: process it.
    New,
    /// Still being processed, no reply yet: drop it.
    InProgress,
    /// Already answered: send the same reply again.
    Replay(Message),
}

/// Remembers recently received `(peer, message id)` pairs and the reply
/// sent for each.
#[derive(Debug)]
pub struct DeduplicationTable {
    lifetime: Duration,
    entries: HashMap<(SocketAddr, u16), DedupEntry>,
}

impl DeduplicationTable {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            lifetime,
            entries: HashMap::new(),
        }
    }

    /// Looks the message up and records it if it is new, as one step.
    pub fn admit(&mut self, peer: SocketAddr, message_id: u16, now: Instant) -> Admission {
        match self.entries.entry((peer, message_id)) {
            Entry::Occupied(mut occupied) => {
                if now.duration_since(occupied.get().inserted) >= self.lifetime {
                    occupied.insert(DedupEntry {
                        reply: None,
                        inserted: now,
                    });
                    return Admission::New;
                }
                match occupied.get().reply {
                    Some(ref reply) => Admission::Replay(reply.clone()),
                    None => Admission::InProgress,
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(DedupEntry {
                    reply: None,
                    inserted: now,
                });
                Admission::New
            }
        }
    }

    /// Caches the reply produced for an admitted message. Only the first
    /// reply for an exchange is kept.
    pub fn record_reply(&mut self, peer: SocketAddr, message_id: u16, reply: &Message) {
        if let Some(entry) = self.entries.get_mut(&(peer, message_id)) {
            if entry.reply.is_none() {
                entry.reply = Some(reply.clone());
            }
        }
    }

    pub fn has_reply(&self, peer: SocketAddr, message_id: u16) -> bool {
        self.entries
            .get(&(peer, message_id))
            .map_or(false, |entry| entry.reply.is_some())
    }

    pub fn prune(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        self.entries
            .retain(|_, entry| now.duration_since(entry.inserted) < lifetime);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MessageClass, MessageExt, MessageType, Status};

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn test_admit_then_replay() {
        let now = Instant::now();
        let mut table = DeduplicationTable::new(Duration::from_secs(247));

        assert_eq!(table.admit(peer(), 7, now), Admission::New);
        assert_eq!(table.admit(peer(), 7, now), Admission::InProgress);
        assert!(!table.has_reply(peer(), 7));

        let mut reply = Message::empty(MessageType::Acknowledgement, 7);
        reply.header.code = MessageClass::Response(Status::Content);
        table.record_reply(peer(), 7, &reply);
        assert_eq!(table.admit(peer(), 7, now), Admission::Replay(reply.clone()));

        // Later replies do not overwrite the first one.
        table.record_reply(peer(), 7, &Message::empty(MessageType::Reset, 7));
        assert_eq!(table.admit(peer(), 7, now), Admission::Replay(reply));
    }

    #[test]
    fn test_keys_are_per_peer() {
        let now = Instant::now();
        let other: SocketAddr = "127.0.0.2:5683".parse().unwrap();
        let mut table = DeduplicationTable::new(Duration::from_secs(247));
        assert_eq!(table.admit(peer(), 1, now), Admission::New);
        assert_eq!(table.admit(other, 1, now), Admission::New);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_entries_expire() {
        let now = Instant::now();
        let lifetime = Duration::from_secs(247);
        let mut table = DeduplicationTable::new(lifetime);
        table.admit(peer(), 1, now);
        table.record_reply(peer(), 1, &Message::empty(MessageType::Acknowledgement, 1));

        assert_eq!(table.admit(peer(), 1, now + lifetime), Admission::New);

        table.prune(now + lifetime * 2);
        assert!(table.is_empty());
    }
}
