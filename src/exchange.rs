//! Correlation of outbound requests with what comes back.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::block::Fragmenter;
use crate::error::{CoapError, Result};
use crate::message::Message;

/// Everything an exchange can report to whoever started it.
#[derive(Debug)]
pub enum ExchangeEvent {
    /// A response, or a notification for an observation.
    Response(Message),
    /// The request was sent again; `attempt` counts retransmissions from 1.
    Retransmission { attempt: u32 },
    TransmissionTimeout,
    Cancelled,
    /// The peer answered with a Reset.
    Reset,
    Failed(CoapError),
}

impl ExchangeEvent {
    /// Whether no further events follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ExchangeEvent::Response(_) | ExchangeEvent::Retransmission { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExchangeKind {
    Request,
    Observation,
}

#[derive(Debug)]
pub(crate) struct ExchangeEntry {
    pub kind: ExchangeKind,
    /// The request as the application issued it, before any block was cut out.
    pub request: Message,
    /// Message id of the request currently in flight, if any.
    pub message_id: Option<u16>,
    pub events: UnboundedSender<ExchangeEvent>,
    pub created: Instant,
    pub block1: Option<Fragmenter>,
}

impl ExchangeEntry {
    pub fn new(
        kind: ExchangeKind,
        request: Message,
        events: UnboundedSender<ExchangeEvent>,
        now: Instant,
    ) -> Self {
        Self {
            kind,
            request,
            message_id: None,
            events,
            created: now,
            block1: None,
        }
    }

    /// Sends an event, ignoring a handle that was already dropped.
    pub fn emit(&self, event: ExchangeEvent) {
        let _ = self.events.send(event);
    }
}

/// Open exchanges by `(peer, token)` and, while a message is in flight, by
/// `(peer, message id)`.
#[derive(Debug, Default)]
pub(crate) struct ExchangeRegistry {
    by_token: HashMap<(SocketAddr, Vec<u8>), ExchangeEntry>,
    by_message_id: HashMap<(SocketAddr, u16), Vec<u8>>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, peer: SocketAddr, token: &[u8], entry: ExchangeEntry) -> Result<()> {
        match self.by_token.entry((peer, token.to_vec())) {
            Entry::Occupied(_) => Err(CoapError::DuplicateExchange),
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(())
            }
        }
    }

    pub fn is_open(&self, peer: SocketAddr, token: &[u8]) -> bool {
        self.by_token.contains_key(&(peer, token.to_vec()))
    }

    /// Records that the exchange's current message went out with `message_id`.
    pub fn bind_message_id(&mut self, peer: SocketAddr, token: &[u8], message_id: u16) {
        if let Some(entry) = self.by_token.get_mut(&(peer, token.to_vec())) {
            if let Some(previous) = entry.message_id.replace(message_id) {
                self.by_message_id.remove(&(peer, previous));
            }
            self.by_message_id.insert((peer, message_id), token.to_vec());
        }
    }

    /// Forgets the id once its ACK or RST arrived; the token stays open.
    pub fn unbind_message_id(&mut self, peer: SocketAddr, message_id: u16) {
        if let Some(token) = self.by_message_id.remove(&(peer, message_id)) {
            if let Some(entry) = self.by_token.get_mut(&(peer, token)) {
                if entry.message_id == Some(message_id) {
                    entry.message_id = None;
                }
            }
        }
    }

    pub fn token_for(&self, peer: SocketAddr, message_id: u16) -> Option<&[u8]> {
        self.by_message_id
            .get(&(peer, message_id))
            .map(|token| token.as_slice())
    }

    pub fn get(&self, peer: SocketAddr, token: &[u8]) -> Option<&ExchangeEntry> {
        self.by_token.get(&(peer, token.to_vec()))
    }

    pub fn get_mut(&mut self, peer: SocketAddr, token: &[u8]) -> Option<&mut ExchangeEntry> {
        self.by_token.get_mut(&(peer, token.to_vec()))
    }

    pub fn remove(&mut self, peer: SocketAddr, token: &[u8]) -> Option<ExchangeEntry> {
        let entry = self.by_token.remove(&(peer, token.to_vec()))?;
        if let Some(message_id) = entry.message_id {
            self.by_message_id.remove(&(peer, message_id));
        }
        Some(entry)
    }

    /// Keys of request exchanges older than `lifetime`. Observations stay
    /// until they are cancelled. The caller closes each one, so that queued
    /// and in-flight messages go with it.
    pub fn expired(&self, now: Instant, lifetime: Duration) -> Vec<(SocketAddr, Vec<u8>)> {
        self.by_token
            .iter()
            .filter(|(_, entry)| {
                entry.kind == ExchangeKind::Request && now.duration_since(entry.created) >= lifetime
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Empties the registry, handing back every open exchange.
    pub fn drain(&mut self) -> Vec<ExchangeEntry> {
        self.by_message_id.clear();
        self.by_token.drain().map(|(_, entry)| entry).collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_token.len()
    }
}

/// Handle to one outbound request.
#[derive(Debug)]
pub struct Exchange {
    peer: SocketAddr,
    token: Vec<u8>,
    events: UnboundedReceiver<ExchangeEvent>,
}

impl Exchange {
    pub(crate) fn new(
        peer: SocketAddr,
        token: Vec<u8>,
        events: UnboundedReceiver<ExchangeEvent>,
    ) -> Self {
        Self {
            peer,
            token,
            events,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// The next event, or `None` once the endpoint dropped the exchange.
    pub async fn next_event(&mut self) -> Option<ExchangeEvent> {
        self.events.recv().await
    }

    /// Waits for the response, turning every other outcome into an error.
    pub async fn response(mut self) -> Result<Message> {
        loop {
            match self.next_event().await {
                Some(ExchangeEvent::Response(message)) => return Ok(message),
                Some(ExchangeEvent::Retransmission { .. }) => continue,
                Some(ExchangeEvent::TransmissionTimeout) => {
                    return Err(CoapError::TransmissionTimeout)
                }
                Some(ExchangeEvent::Cancelled) => return Err(CoapError::Cancelled),
                Some(ExchangeEvent::Reset) => return Err(CoapError::Reset),
                Some(ExchangeEvent::Failed(e)) => return Err(e),
                None => return Err(CoapError::Shutdown),
            }
        }
    }
}

/// Handle to an observation: a stream of notifications and lifecycle events.
#[derive(Debug)]
pub struct Observation {
    peer: SocketAddr,
    token: Vec<u8>,
    events: UnboundedReceiverStream<ExchangeEvent>,
}

impl Observation {
    pub(crate) fn new(
        peer: SocketAddr,
        token: Vec<u8>,
        events: UnboundedReceiver<ExchangeEvent>,
    ) -> Self {
        Self {
            peer,
            token,
            events: UnboundedReceiverStream::new(events),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn token(&self) -> &[u8] {
        &self.token
    }

    /// The next notification. `None` once the observation ended; a terminal
    /// event other than a plain end is reported as an error first.
    pub async fn next_notification(&mut self) -> Option<Result<Message>> {
        loop {
            match self.events.next().await? {
                ExchangeEvent::Response(message) => return Some(Ok(message)),
                ExchangeEvent::Retransmission { .. } => continue,
                ExchangeEvent::TransmissionTimeout => {
                    return Some(Err(CoapError::TransmissionTimeout))
                }
                ExchangeEvent::Cancelled => return None,
                ExchangeEvent::Reset => return Some(Err(CoapError::Reset)),
                ExchangeEvent::Failed(e) => return Some(Err(e)),
            }
        }
    }
}

impl Stream for Observation {
    type Item = ExchangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MessageExt, MessageType, Method};
    use tokio::sync::mpsc;

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn entry(kind: ExchangeKind, now: Instant) -> (ExchangeEntry, UnboundedReceiver<ExchangeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let request = Message::request(Method::Get, MessageType::Confirmable);
        (ExchangeEntry::new(kind, request, tx, now), rx)
    }

    #[test]
    fn test_token_unique_until_removed() {
        let now = Instant::now();
        let mut registry = ExchangeRegistry::new();
        let (first, _rx1) = entry(ExchangeKind::Request, now);
        let (second, _rx2) = entry(ExchangeKind::Request, now);
        let (third, _rx3) = entry(ExchangeKind::Request, now);

        registry.register(peer(), b"tk", first).unwrap();
        assert!(matches!(
            registry.register(peer(), b"tk", second),
            Err(CoapError::DuplicateExchange)
        ));

        let other: SocketAddr = "127.0.0.2:5683".parse().unwrap();
        let (for_other, _rx4) = entry(ExchangeKind::Request, now);
        registry.register(other, b"tk", for_other).unwrap();

        assert!(registry.remove(peer(), b"tk").is_some());
        registry.register(peer(), b"tk", third).unwrap();
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_message_id_binding() {
        let now = Instant::now();
        let mut registry = ExchangeRegistry::new();
        let (e, _rx) = entry(ExchangeKind::Request, now);
        registry.register(peer(), b"tk", e).unwrap();

        registry.bind_message_id(peer(), b"tk", 10);
        assert_eq!(registry.token_for(peer(), 10), Some(&b"tk"[..]));

        registry.bind_message_id(peer(), b"tk", 11);
        assert_eq!(registry.token_for(peer(), 10), None);
        assert_eq!(registry.token_for(peer(), 11), Some(&b"tk"[..]));

        registry.unbind_message_id(peer(), 11);
        assert_eq!(registry.token_for(peer(), 11), None);
        assert!(registry.is_open(peer(), b"tk"));

        registry.bind_message_id(peer(), b"tk", 12);
        registry.remove(peer(), b"tk");
        assert_eq!(registry.token_for(peer(), 12), None);
    }

    #[test]
    fn test_expire_keeps_observations() {
        let now = Instant::now();
        let lifetime = Duration::from_secs(247);
        let mut registry = ExchangeRegistry::new();
        let (request, _rx1) = entry(ExchangeKind::Request, now);
        let (observation, _rx2) = entry(ExchangeKind::Observation, now);
        registry.register(peer(), b"req", request).unwrap();
        registry.register(peer(), b"obs", observation).unwrap();

        assert!(registry.expired(now + Duration::from_secs(1), lifetime).is_empty());
        let expired = registry.expired(now + lifetime, lifetime);
        assert_eq!(expired, vec![(peer(), b"req".to_vec())]);
        assert!(registry.is_open(peer(), b"obs"));
    }

    #[tokio::test]
    async fn test_response_skips_retransmissions() {
        let (tx, rx) = mpsc::unbounded_channel();
        let exchange = Exchange::new(peer(), b"tk".to_vec(), rx);
        tx.send(ExchangeEvent::Retransmission { attempt: 1 }).unwrap();
        tx.send(ExchangeEvent::Response(Message::new())).unwrap();
        assert!(exchange.response().await.is_ok());

        let (tx, rx) = mpsc::unbounded_channel();
        let exchange = Exchange::new(peer(), b"tk".to_vec(), rx);
        tx.send(ExchangeEvent::TransmissionTimeout).unwrap();
        assert!(matches!(
            exchange.response().await,
            Err(CoapError::TransmissionTimeout)
        ));
    }
}
