//! The endpoint: one transport, the tasks driving it, and the state every
//! exchange over it shares.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, error, trace, warn};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{self, Instant};
use tokio_stream::wrappers::IntervalStream;
use tokio_util::codec::Decoder;

use coap_lite::option_value::OptionValueU32;

use crate::block::{
    block_offset, block_size, block_value, continue_response, fragment_response, is_continue,
    BlockwiseManager, Fragmenter, RequestCacheKey,
};
use crate::config::EndpointConfig;
use crate::dedup::{Admission, DeduplicationTable};
use crate::error::{CoapError, FormatError, Result};
use crate::exchange::{Exchange, ExchangeEntry, ExchangeEvent, ExchangeKind, ExchangeRegistry, Observation};
use crate::ids::{MessageIdAllocator, TokenGenerator};
use crate::message::{
    encode, BlockValue, CoapOption, Message, MessageClass, MessageExt, MessageType, Method,
    ObserveOption, Status,
};
use crate::observer::{ObservationState, ObservationTable, ObserveRegistry, Verdict};
use crate::retransmit::{Origin, Queued, RetransmissionScheduler, TimerOutcome};
use crate::server::{Request, Resource};
use crate::transport::Transport;
use crate::MessageCodec;

/// An inbound message, sorted by what the endpoint has to do with it.
#[derive(Debug)]
enum Inbound {
    /// Empty CON: answered with a Reset.
    Ping(u16),
    /// Empty ACK.
    Ack(u16),
    /// ACK carrying a response.
    PiggybackedResponse(Message),
    Reset(u16),
    /// CON or NON request.
    Request(Message),
    /// CON or NON response: separate response or notification.
    Response(Message),
    /// Well-formed but meaningless here, e.g. an ACK carrying a request.
    Rejected(Message),
}

impl Inbound {
    fn classify(message: Message) -> Inbound {
        let message_id = message.header.message_id;
        match (message.header.get_type(), message.header.code) {
            (MessageType::Confirmable, MessageClass::Empty) => Inbound::Ping(message_id),
            (MessageType::Acknowledgement, MessageClass::Empty) => Inbound::Ack(message_id),
            (MessageType::Reset, _) => Inbound::Reset(message_id),
            (MessageType::Acknowledgement, _) if message.is_response() => {
                Inbound::PiggybackedResponse(message)
            }
            (MessageType::Confirmable | MessageType::NonConfirmable, MessageClass::Request(_)) => {
                Inbound::Request(message)
            }
            (MessageType::Confirmable | MessageType::NonConfirmable, _) if message.is_response() => {
                Inbound::Response(message)
            }
            _ => Inbound::Rejected(message),
        }
    }
}

struct State {
    message_ids: HashMap<SocketAddr, MessageIdAllocator>,
    tokens: TokenGenerator,
    dedup: DeduplicationTable,
    scheduler: RetransmissionScheduler,
    exchanges: ExchangeRegistry,
    observations: ObservationTable,
    observers: ObserveRegistry,
    blocks: BlockwiseManager,
    shutdown: bool,
}

impl State {
    fn new(config: &EndpointConfig) -> Self {
        let lifetime = config.transmission.exchange_lifetime();
        Self {
            message_ids: HashMap::new(),
            tokens: TokenGenerator::new(config.token_length),
            dedup: DeduplicationTable::new(lifetime),
            scheduler: RetransmissionScheduler::new(config.transmission.clone()),
            exchanges: ExchangeRegistry::new(),
            observations: ObservationTable::new(),
            observers: ObserveRegistry::new(lifetime),
            blocks: BlockwiseManager::new(lifetime, config.max_body_size),
            shutdown: false,
        }
    }
}

struct Shared {
    config: EndpointConfig,
    local_addr: SocketAddr,
    epoch: Instant,
    state: Mutex<State>,
    resources: RwLock<HashMap<String, Arc<dyn Resource>>>,
    outbound: UnboundedSender<(Bytes, SocketAddr)>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Context a handler task needs once the handler returned.
struct Invocation {
    request: Message,
    peer: SocketAddr,
    resource: Arc<dyn Resource>,
    block1: Option<BlockValue>,
}

/// A CoAP endpoint bound to one transport, acting as client and server.
///
/// Cloning is cheap; every clone drives the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Binds a UDP socket and starts the endpoint on it.
    pub async fn bind<A: ToSocketAddrs>(addr: A, config: EndpointConfig) -> Result<Endpoint> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("Bound to socket: {}", socket.local_addr()?);
        Endpoint::with_transport(socket, config)
    }

    /// Starts an endpoint on any [`Transport`]. Must be called from within a
    /// tokio runtime.
    pub fn with_transport<T: Transport>(transport: T, config: EndpointConfig) -> Result<Endpoint> {
        let local_addr = transport.local_addr()?;
        let transport = Arc::new(transport);
        let (outbound, mut outbound_rx) = unbounded_channel::<(Bytes, SocketAddr)>();

        let shared = Arc::new(Shared {
            state: Mutex::new(State::new(&config)),
            config,
            local_addr,
            epoch: Instant::now(),
            resources: RwLock::new(HashMap::new()),
            outbound,
            tasks: Mutex::new(Vec::new()),
        });

        let writer_transport = transport.clone();
        let writer = tokio::spawn(async move {
            while let Some((datagram, peer)) = outbound_rx.recv().await {
                trace!("Sending {} bytes to {}", datagram.len(), peer);
                if let Err(e) = writer_transport.send_to(&datagram, peer).await {
                    error!("Error sending to {}: {}", peer, e);
                }
            }
        });

        let weak = Arc::downgrade(&shared);
        let max_datagram_size = shared.config.max_datagram_size;
        let listener = tokio::spawn(async move {
            let mut buf = vec![0u8; max_datagram_size];
            let mut codec = MessageCodec;
            debug!("Started listener task");

            loop {
                let (n, peer) = match transport.recv(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!("Error receiving: {}", e);
                        continue;
                    }
                };
                let Some(shared) = weak.upgrade() else { return };

                trace!("Received data: {:?} from {:?}", &buf[..n], peer);
                let mut datagram = BytesMut::from(&buf[..n]);
                match codec.decode(&mut datagram) {
                    Ok(Some(message)) => shared.dispatch(peer, message),
                    Ok(None) => {}
                    Err(e) => shared.reject_malformed(peer, &buf[..n], e),
                }
            }
        });

        let weak = Arc::downgrade(&shared);
        let interval = time::interval(shared.config.housekeeping_interval);
        let housekeeping = tokio::spawn(async move {
            let mut ticks = IntervalStream::new(interval);
            while ticks.next().await.is_some() {
                match weak.upgrade() {
                    Some(shared) => shared.housekeeping(),
                    None => return,
                }
            }
        });

        shared
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([writer, listener, housekeeping]);

        Ok(Endpoint { shared })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    /// Serves `resource` at `path` (segments joined by `/`, leading slash optional).
    pub fn add_resource<R: Resource>(&self, path: &str, resource: R) {
        self.shared
            .resources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(normalize_path(path), Arc::new(resource));
    }

    pub fn remove_resource(&self, path: &str) -> bool {
        self.shared
            .resources
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&normalize_path(path))
            .is_some()
    }

    /// Sends a request to `peer`. Without a token in `request`, an unused one
    /// is drawn. Payloads larger than the configured block size go out
    /// through Block1.
    pub fn request(&self, peer: SocketAddr, request: Message) -> Result<Exchange> {
        let (token, events) = self.shared.start(peer, request, ExchangeKind::Request)?;
        Ok(Exchange::new(peer, token, events))
    }

    /// Registers an observation with a GET carrying Observe 0.
    pub fn observe(&self, peer: SocketAddr, mut request: Message) -> Result<Observation> {
        if request.method() != Some(Method::Get) {
            return Err(CoapError::InvalidRequest("only GET can observe"));
        }
        request.set_observe_value(ObserveOption::Register as u32);
        let (token, events) = self.shared.start(peer, request, ExchangeKind::Observation)?;
        Ok(Observation::new(peer, token, events))
    }

    /// Abandons a request. Returns false if it already ended.
    pub fn cancel(&self, exchange: &Exchange) -> bool {
        self.shared.cancel(exchange.peer(), exchange.token())
    }

    /// Cancels an observation actively, with a GET carrying Observe 1 on
    /// the same token. The observation ends with `Cancelled`; the returned
    /// exchange carries the server's answer.
    pub fn cancel_observation(&self, observation: &Observation) -> Result<Exchange> {
        let peer = observation.peer();
        let token = observation.token().to_vec();

        let mut state = self.shared.lock();
        if !state.observations.remove(peer, &token) {
            return Err(CoapError::InvalidRequest("not an active observation"));
        }
        let entry = match self.shared.close_exchange(&mut state, peer, &token) {
            Some(entry) => entry,
            None => return Err(CoapError::InvalidRequest("not an active observation")),
        };
        entry.emit(ExchangeEvent::Cancelled);

        let mut request = entry.request.clone();
        request.set_observe_value(ObserveOption::Deregister as u32);
        let (tx, rx) = unbounded_channel();
        let now = self.shared.now();
        let registered = ExchangeEntry::new(ExchangeKind::Request, request.clone(), tx, now);
        state.exchanges.register(peer, &token, registered)?;
        if let Err(e) = self.shared.transmit(&mut state, peer, request, Origin::Request { token: token.clone() }) {
            state.exchanges.remove(peer, &token);
            return Err(e);
        }
        self.shared.drain_queue(&mut state, peer);
        Ok(Exchange::new(peer, token, rx))
    }

    /// Cancels an observation lazily: the next notification is answered
    /// with a Reset, which makes the server forget us.
    pub fn cancel_observation_lazily(&self, observation: &Observation) -> bool {
        self.shared
            .lock()
            .observations
            .cancel_lazily(observation.peer(), observation.token())
    }

    /// `Cancelled` once the observation ended for any reason. A lazily
    /// cancelled observation stays `Active` until the next notification.
    pub fn observation_state(&self, observation: &Observation) -> ObservationState {
        self.shared
            .lock()
            .observations
            .state(observation.peer(), observation.token())
    }

    /// Pushes the current representation of `path` to every observer.
    pub async fn notify_observers(&self, path: &str) {
        self.shared.notify_observers(&normalize_path(path)).await
    }

    pub fn observer_count(&self, path: &str) -> usize {
        self.shared.lock().observers.observer_count(&normalize_path(path))
    }

    /// Stops every task and fails all open exchanges with `Shutdown`.
    pub fn shutdown(&self) {
        self.shared.shutdown();
    }
}

fn normalize_path(path: &str) -> String {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> std::time::Instant {
        Instant::now().into_std()
    }

    fn millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn send(&self, message: &Message, peer: SocketAddr) {
        match encode(message) {
            Ok(datagram) => self.send_datagram(Bytes::from(datagram), peer),
            Err(e) => error!("Could not encode message to {}: {}", peer, e),
        }
    }

    fn send_datagram(&self, datagram: Bytes, peer: SocketAddr) {
        if self.outbound.send((datagram, peer)).is_err() {
            debug!("Writer gone, dropping datagram to {}", peer);
        }
    }

    fn preferred_block_size(&self) -> usize {
        block_size(self.config.block_size)
    }

    fn allocate_message_id(&self, state: &mut State, peer: SocketAddr) -> Result<u16> {
        let lifetime = self.config.transmission.exchange_lifetime();
        state
            .message_ids
            .entry(peer)
            .or_insert_with(|| MessageIdAllocator::new(lifetime))
            .allocate(self.now())
    }

    /// Opens an exchange and sends its first message.
    fn start(
        self: &Arc<Self>,
        peer: SocketAddr,
        mut request: Message,
        kind: ExchangeKind,
    ) -> Result<(Vec<u8>, tokio::sync::mpsc::UnboundedReceiver<ExchangeEvent>)> {
        if request.method().is_none() {
            return Err(CoapError::InvalidRequest("not a request code"));
        }
        if !matches!(
            request.header.get_type(),
            MessageType::Confirmable | MessageType::NonConfirmable
        ) {
            return Err(CoapError::InvalidRequest("requests are CON or NON"));
        }

        let mut state = self.lock();
        if state.shutdown {
            return Err(CoapError::Shutdown);
        }

        if request.get_token().is_empty() {
            let token = {
                let State { exchanges, tokens, .. } = &mut *state;
                tokens.generate(|t| exchanges.is_open(peer, t))?
            };
            request.set_token(token);
        }
        let token = request.get_token().to_vec();

        let now = self.now();
        let (tx, rx) = unbounded_channel();
        let mut entry = ExchangeEntry::new(kind, request.clone(), tx, now);

        let size = self.preferred_block_size();
        let mut first = request;
        if Fragmenter::needs_fragmentation(first.payload.len(), size) && first.block1().is_none() {
            let fragmenter = Fragmenter::new(first.payload.clone(), size)?;
            let (block, bytes) = fragmenter.current()?;
            first.payload = bytes.to_vec();
            first.set_block1(block);
            first.replace_option(
                CoapOption::Size1,
                OptionValueU32(fragmenter.total_len() as u32).into(),
            );
            entry.block1 = Some(fragmenter);
        }

        state.exchanges.register(peer, &token, entry)?;
        if kind == ExchangeKind::Observation {
            state.observations.insert(peer, &token);
        }

        debug!("Opening exchange {:?} with {}", token, peer);
        if let Err(e) = self.transmit(&mut state, peer, first, Origin::Request { token: token.clone() }) {
            state.exchanges.remove(peer, &token);
            state.observations.remove(peer, &token);
            return Err(e);
        }
        Ok((token, rx))
    }

    /// Sends a CON or NON message, queueing a CON while NSTART is reached.
    fn transmit(
        self: &Arc<Self>,
        state: &mut State,
        peer: SocketAddr,
        mut message: Message,
        origin: Origin,
    ) -> Result<()> {
        if message.header.get_type() == MessageType::Confirmable {
            if !state.scheduler.has_capacity(&peer) {
                state.scheduler.enqueue(peer, Queued { message, origin });
                return Ok(());
            }
            return self.transmit_confirmable(state, peer, message, origin);
        }

        let message_id = self.allocate_message_id(state, peer)?;
        message.header.message_id = message_id;
        self.bind_origin(state, peer, message_id, &origin);
        self.send(&message, peer);
        Ok(())
    }

    fn transmit_confirmable(
        self: &Arc<Self>,
        state: &mut State,
        peer: SocketAddr,
        mut message: Message,
        origin: Origin,
    ) -> Result<()> {
        let message_id = self.allocate_message_id(state, peer)?;
        message.header.message_id = message_id;
        self.bind_origin(state, peer, message_id, &origin);

        let datagram = Bytes::from(encode(&message)?);
        let timeout = state.scheduler.initial_timeout(&mut rand::thread_rng());
        let generation = state
            .scheduler
            .register(peer, message_id, datagram.clone(), timeout, origin);
        self.send_datagram(datagram, peer);

        let timer = self.spawn_timer(peer, message_id, generation, timeout);
        state.scheduler.attach_timer(peer, message_id, timer);
        Ok(())
    }

    fn bind_origin(&self, state: &mut State, peer: SocketAddr, message_id: u16, origin: &Origin) {
        match origin {
            Origin::Request { token } => state.exchanges.bind_message_id(peer, token, message_id),
            Origin::Notification { path, token } => {
                state
                    .observers
                    .record_notification(peer, message_id, path, token, self.now())
            }
            Origin::Response => {}
        }
    }

    fn spawn_timer(
        self: &Arc<Self>,
        peer: SocketAddr,
        message_id: u16,
        generation: u64,
        timeout: Duration,
    ) -> AbortHandle {
        let weak: Weak<Shared> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut timeout = timeout;
            loop {
                time::sleep(timeout).await;
                let Some(shared) = weak.upgrade() else { return };
                match shared.on_timer(peer, message_id, generation) {
                    Some(next) => timeout = next,
                    None => return,
                }
            }
        })
        .abort_handle()
    }

    /// Returns the next timeout while retransmissions remain.
    fn on_timer(self: &Arc<Self>, peer: SocketAddr, message_id: u16, generation: u64) -> Option<Duration> {
        let mut state = self.lock();
        match state.scheduler.on_timer(peer, message_id, generation) {
            TimerOutcome::Retransmit {
                datagram,
                next_timeout,
                attempt,
                origin,
            } => {
                self.send_datagram(datagram, peer);
                if let Origin::Request { token } = origin {
                    if let Some(entry) = state.exchanges.get(peer, &token) {
                        entry.emit(ExchangeEvent::Retransmission { attempt });
                    }
                }
                Some(next_timeout)
            }
            TimerOutcome::Exhausted { origin } => {
                self.fail_origin(&mut state, peer, &origin, None);
                self.drain_queue(&mut state, peer);
                None
            }
            TimerOutcome::Stale => None,
        }
    }

    /// Tells whoever sent a confirmable message that it failed. `None` means
    /// the retransmissions ran out.
    fn fail_origin(&self, state: &mut State, peer: SocketAddr, origin: &Origin, error: Option<CoapError>) {
        match origin {
            Origin::Request { token } => {
                if let Some(entry) = self.close_exchange(state, peer, token) {
                    debug!("Exchange {:?} with {} failed", token, peer);
                    entry.emit(match error {
                        Some(e) => ExchangeEvent::Failed(e),
                        None => ExchangeEvent::TransmissionTimeout,
                    });
                }
            }
            Origin::Notification { path, token } => {
                debug!("Notification to {} failed, dropping observer of {}", peer, path);
                state.observers.deregister(path, peer, token);
            }
            Origin::Response => {
                debug!("Separate response to {} was not acknowledged", peer);
            }
        }
    }

    /// Removes an exchange with everything attached to it.
    fn close_exchange(&self, state: &mut State, peer: SocketAddr, token: &[u8]) -> Option<ExchangeEntry> {
        let entry = state.exchanges.remove(peer, token)?;
        if let Some(message_id) = entry.message_id {
            state.scheduler.acknowledge(peer, message_id);
        }
        state.scheduler.remove_queued(
            &peer,
            &Origin::Request {
                token: token.to_vec(),
            },
        );
        state.observations.remove(peer, token);
        state.blocks.discard(peer, token);
        Some(entry)
    }

    /// Sends queued CONs while NSTART allows.
    fn drain_queue(self: &Arc<Self>, state: &mut State, peer: SocketAddr) {
        while let Some(queued) = state.scheduler.dequeue(&peer) {
            let origin = queued.origin.clone();
            if let Err(e) = self.transmit_confirmable(state, peer, queued.message, queued.origin) {
                self.fail_origin(state, peer, &origin, Some(e));
            }
        }
    }

    fn cancel(self: &Arc<Self>, peer: SocketAddr, token: &[u8]) -> bool {
        let mut state = self.lock();
        match self.close_exchange(&mut state, peer, token) {
            Some(entry) => {
                debug!("Cancelled exchange {:?} with {}", token, peer);
                entry.emit(ExchangeEvent::Cancelled);
                self.drain_queue(&mut state, peer);
                true
            }
            None => false,
        }
    }

    /// Answers a datagram that failed to decode with a Reset when its
    /// header is readable and it is a CON.
    fn reject_malformed(&self, peer: SocketAddr, bytes: &[u8], e: CoapError) {
        debug!("Dropping malformed datagram from {}: {}", peer, e);
        if bytes.len() < 4 || bytes[0] >> 6 != 1 || (bytes[0] >> 4) & 0x3 != 0 {
            return;
        }
        let message_id = u16::from_be_bytes([bytes[2], bytes[3]]);
        self.send(&Message::empty(MessageType::Reset, message_id), peer);
    }

    fn dispatch(self: &Arc<Self>, peer: SocketAddr, message: Message) {
        debug!("Received packet: {:?}", message);

        match Inbound::classify(message) {
            Inbound::Ping(message_id) => {
                self.send(&Message::empty(MessageType::Reset, message_id), peer);
            }
            Inbound::Ack(message_id) => {
                let mut state = self.lock();
                self.acknowledged(&mut state, peer, message_id);
            }
            Inbound::PiggybackedResponse(message) => {
                let mut state = self.lock();
                let message_id = message.header.message_id;
                // Only the ACK of the message in flight carries its response;
                // a duplicated ACK of an earlier block must not be replayed.
                let in_flight =
                    state.exchanges.token_for(peer, message_id) == Some(message.get_token());
                self.acknowledged(&mut state, peer, message_id);
                if in_flight {
                    self.handle_response(&mut state, peer, message);
                } else {
                    trace!("Dropping ACK {} from {}: nothing in flight", message_id, peer);
                }
            }
            Inbound::Reset(message_id) => {
                let mut state = self.lock();
                self.reset(&mut state, peer, message_id);
            }
            Inbound::Request(message) => self.admit_request(peer, message),
            Inbound::Response(message) => {
                let mut state = self.lock();
                let message_id = message.header.message_id;
                let confirmable = message.header.get_type() == MessageType::Confirmable;
                match state.dedup.admit(peer, message_id, self.now()) {
                    Admission::New => {}
                    Admission::InProgress => return,
                    Admission::Replay(reply) => {
                        if confirmable {
                            self.send(&reply, peer);
                        }
                        return;
                    }
                }

                let known = state.exchanges.is_open(peer, message.get_token());
                let reply = if known {
                    self.handle_response(&mut state, peer, message);
                    confirmable.then(|| Message::empty(MessageType::Acknowledgement, message_id))
                } else {
                    debug!("Response from {} with unknown token {:?}", peer, message.get_token());
                    Some(Message::empty(MessageType::Reset, message_id))
                };
                if let Some(reply) = reply {
                    // A lazily cancelled observation was already answered with a Reset.
                    if !state.dedup.has_reply(peer, message_id) {
                        self.send(&reply, peer);
                        state.dedup.record_reply(peer, message_id, &reply);
                    }
                }
            }
            Inbound::Rejected(message) => {
                let message_type = message.header.get_type();
                debug!("Rejecting {:?} {} from {}", message_type, message.header.code, peer);
                if message_type == MessageType::Confirmable {
                    self.send(&Message::empty(MessageType::Reset, message.header.message_id), peer);
                }
            }
        }
    }

    fn acknowledged(self: &Arc<Self>, state: &mut State, peer: SocketAddr, message_id: u16) {
        if let Some(origin) = state.scheduler.acknowledge(peer, message_id) {
            trace!("{} acknowledged {} ({:?})", peer, message_id, origin);
            if let Origin::Request { .. } = origin {
                state.exchanges.unbind_message_id(peer, message_id);
            }
            self.drain_queue(state, peer);
        }
    }

    fn reset(self: &Arc<Self>, state: &mut State, peer: SocketAddr, message_id: u16) {
        let origin = state.scheduler.acknowledge(peer, message_id);
        let token = state.exchanges.token_for(peer, message_id).map(|t| t.to_vec());
        if let Some(token) = token {
            if let Some(entry) = self.close_exchange(state, peer, &token) {
                debug!("Exchange {:?} reset by {}", token, peer);
                entry.emit(ExchangeEvent::Reset);
            }
        } else if state.observers.reset_received(peer, message_id) {
            debug!("Observer {} reset a notification", peer);
        } else if let Some(Origin::Notification { path, token }) = origin.as_ref() {
            state.observers.deregister(path, peer, token);
        }
        if origin.is_some() {
            self.drain_queue(state, peer);
        }
    }

    /// Routes a response to its exchange. Sends any Reset it calls for itself.
    fn handle_response(self: &Arc<Self>, state: &mut State, peer: SocketAddr, mut message: Message) {
        let token = message.get_token().to_vec();
        let (kind, in_flight) = match state.exchanges.get(peer, &token) {
            Some(entry) => (entry.kind, entry.message_id),
            None => {
                trace!("No exchange for {:?} from {}", token, peer);
                return;
            }
        };

        // A separate response also acknowledges the request.
        if message.header.get_type() != MessageType::Acknowledgement {
            if let Some(request_id) = in_flight {
                if state.scheduler.acknowledge(peer, request_id).is_some() {
                    self.drain_queue(state, peer);
                }
                state.exchanges.unbind_message_id(peer, request_id);
            }
        }

        if kind == ExchangeKind::Observation {
            self.handle_notification(state, peer, &token, message);
            return;
        }

        if is_continue(&message) {
            if let Some(next) = self.next_block1(state, peer, &token, &message) {
                match next {
                    Ok(request) => {
                        if let Err(e) = self.transmit(state, peer, request, Origin::Request { token: token.clone() }) {
                            self.fail_origin(state, peer, &Origin::Request { token }, Some(e));
                        }
                    }
                    Err(e) => self.fail_origin(state, peer, &Origin::Request { token }, Some(e)),
                }
                return;
            }
        }

        match message.block2() {
            Some(Err(e)) => {
                self.fail_origin(state, peer, &Origin::Request { token }, Some(e.into()));
            }
            Some(Ok(block)) if block.more || block.num > 0 => {
                let now = self.now();
                match state.blocks.reassemble(peer, &token, &block, &message.payload, now) {
                    Ok(None) => {
                        let next = state.exchanges.get(peer, &token).and_then(|entry| {
                            follow_up_request(&entry.request, &block)
                        });
                        let result = match next {
                            Some(request) => {
                                self.transmit(state, peer, request, Origin::Request { token: token.clone() })
                            }
                            None => Err(FormatError::InvalidBlockValue.into()),
                        };
                        if let Err(e) = result {
                            self.fail_origin(state, peer, &Origin::Request { token }, Some(e));
                        }
                    }
                    Ok(Some(body)) => {
                        message.payload = body;
                        message.clear_option(CoapOption::Block2);
                        if let Some(entry) = self.close_exchange(state, peer, &token) {
                            entry.emit(ExchangeEvent::Response(message));
                        }
                    }
                    Err(e) => self.fail_origin(state, peer, &Origin::Request { token }, Some(e)),
                }
            }
            _ => {
                if let Some(entry) = self.close_exchange(state, peer, &token) {
                    entry.emit(ExchangeEvent::Response(message));
                }
            }
        }
    }

    /// The next Block1 request after a 2.31 Continue, or `None` when the
    /// exchange is not sending a body block-wise or has nothing left to send.
    fn next_block1(
        &self,
        state: &mut State,
        peer: SocketAddr,
        token: &[u8],
        message: &Message,
    ) -> Option<Result<Message>> {
        let entry = state.exchanges.get_mut(peer, token)?;
        let request = entry.request.clone();
        let fragmenter = entry.block1.as_mut()?;

        let confirmed = match message.block1() {
            Some(Ok(block)) => block,
            Some(Err(e)) => return Some(Err(e.into())),
            None => match fragmenter.current() {
                Ok((block, _)) => block,
                Err(e) => return Some(Err(e)),
            },
        };
        match fragmenter.advance(&confirmed) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => return Some(Err(e)),
        }
        let (block, bytes) = match fragmenter.current() {
            Ok(current) => current,
            Err(e) => return Some(Err(e)),
        };
        let mut next = request;
        next.payload = bytes.to_vec();
        next.set_block1(block);
        next.clear_option(CoapOption::Size1);
        Some(Ok(next))
    }

    fn handle_notification(
        self: &Arc<Self>,
        state: &mut State,
        peer: SocketAddr,
        token: &[u8],
        message: Message,
    ) {
        let sequence = match message.observe_value() {
            Some(sequence) if message.status().map_or(false, |s| !s.is_error()) => sequence,
            _ => {
                // The server does not (or no longer) keep us registered.
                if let Some(entry) = self.close_exchange(state, peer, token) {
                    entry.emit(ExchangeEvent::Response(message));
                }
                return;
            }
        };

        match state.observations.on_notification(peer, token, sequence, self.millis()) {
            Some(Verdict::Accept) => {
                if let Some(entry) = state.exchanges.get(peer, token) {
                    entry.emit(ExchangeEvent::Response(message));
                }
            }
            Some(Verdict::Stale) | None => {}
            Some(Verdict::Reject) => {
                if message.header.get_type() != MessageType::Acknowledgement {
                    let message_id = message.header.message_id;
                    let reset = Message::empty(MessageType::Reset, message_id);
                    self.send(&reset, peer);
                    state.dedup.record_reply(peer, message_id, &reset);
                }
                if let Some(entry) = self.close_exchange(state, peer, token) {
                    debug!("Lazily cancelled observation {:?} with {}", token, peer);
                    entry.emit(ExchangeEvent::Cancelled);
                }
            }
        }
    }

    fn admit_request(self: &Arc<Self>, peer: SocketAddr, mut request: Message) {
        let mut state = self.lock();
        let message_id = request.header.message_id;
        let confirmable = request.header.get_type() == MessageType::Confirmable;

        match state.dedup.admit(peer, message_id, self.now()) {
            Admission::New => {}
            Admission::InProgress => {
                trace!("Request {} from {} still in progress", message_id, peer);
                return;
            }
            Admission::Replay(reply) => {
                trace!("Replaying reply to {} from {}", message_id, peer);
                if confirmable {
                    self.send(&reply, peer);
                }
                return;
            }
        }
        let now = self.now();
        let path = request.path();

        // Follow-up blocks of a large response come from the cache.
        if let Some(Ok(block)) = request.block2() {
            if block.num > 0 {
                let key = RequestCacheKey::new(&request, peer);
                if let Some(reply) = state.blocks.cached_block(&key, &request, &block) {
                    self.reply(&mut state, peer, &request, reply);
                    return;
                }
            }
        }

        let mut block1 = None;
        match request.block1() {
            None => {}
            Some(Err(_)) => {
                let reply = Message::response_to(&request, Status::BadOption);
                self.reply(&mut state, peer, &request, reply);
                return;
            }
            Some(Ok(block)) => {
                let token = request.get_token().to_vec();
                match state.blocks.reassemble(peer, &token, &block, &request.payload, now) {
                    Ok(None) => {
                        let reply = continue_response(&request, block);
                        self.reply(&mut state, peer, &request, reply);
                        return;
                    }
                    Ok(Some(body)) => {
                        request.payload = body;
                        request.clear_option(CoapOption::Block1);
                        block1 = Some(block);
                    }
                    Err(e) => {
                        let mut reply = match e {
                            CoapError::BlockSequence { .. } | CoapError::BlockSizeGrowth { .. } => {
                                Message::response_to(&request, Status::RequestEntityIncomplete)
                            }
                            CoapError::BodyTooLarge(_) => {
                                let mut reply =
                                    Message::response_to(&request, Status::RequestEntityTooLarge);
                                reply.add_option_as(
                                    CoapOption::Size1,
                                    OptionValueU32(self.config.max_body_size as u32),
                                );
                                reply
                            }
                            _ => Message::response_to(&request, Status::BadRequest),
                        };
                        reply.payload = e.to_string().into_bytes();
                        self.reply(&mut state, peer, &request, reply);
                        return;
                    }
                }
            }
        }

        let resource = self
            .resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
            .cloned();
        let resource = match resource {
            Some(resource) => resource,
            None => {
                debug!("No resource at {:?} for {}", path, peer);
                let reply = Message::response_to(&request, Status::NotFound);
                self.reply(&mut state, peer, &request, reply);
                return;
            }
        };

        if request.method() == Some(Method::Get)
            && request.observe_flag() == Some(ObserveOption::Deregister)
        {
            state.observers.deregister(&path, peer, request.get_token());
        }
        drop(state);

        let shared = self.clone();
        tokio::spawn(async move {
            shared
                .invoke(Invocation {
                    request,
                    peer,
                    resource,
                    block1,
                })
                .await
        });
    }

    /// Sends a reply to a request and remembers it for duplicates.
    fn reply(&self, state: &mut State, peer: SocketAddr, request: &Message, mut reply: Message) {
        if reply.header.get_type() == MessageType::NonConfirmable {
            match self.allocate_message_id(state, peer) {
                Ok(message_id) => reply.header.message_id = message_id,
                Err(e) => {
                    warn!("Could not answer {}: {}", peer, e);
                    return;
                }
            }
        }
        self.send(&reply, peer);
        state.dedup.record_reply(peer, request.header.message_id, &reply);
    }

    async fn invoke(self: Arc<Self>, invocation: Invocation) {
        let Invocation {
            request,
            peer,
            resource,
            block1,
        } = invocation;
        let confirmable = request.header.get_type() == MessageType::Confirmable;

        let mut handler = resource.handle(Request {
            message: request.clone(),
            source: peer,
        });
        let mut separate = false;
        let response = if confirmable {
            tokio::select! {
                response = &mut handler => response,
                _ = time::sleep(self.config.piggyback_window) => {
                    let message_id = request.header.message_id;
                    debug!("Handler for {} is slow, acknowledging {}", peer, message_id);
                    let ack = Message::empty(MessageType::Acknowledgement, message_id);
                    {
                        let mut state = self.lock();
                        self.reply(&mut state, peer, &request, ack);
                    }
                    separate = true;
                    handler.await
                }
            }
        } else {
            handler.await
        };

        let mut reply = response.into_message(&request);
        let mut state = self.lock();
        if state.shutdown {
            return;
        }

        let path = request.path();
        let success = reply.status().map_or(false, |s| !s.is_error());
        if request.method() == Some(Method::Get)
            && request.observe_flag() == Some(ObserveOption::Register)
        {
            if success && resource.is_observable() {
                let sequence = state.observers.register(&path, peer, &request);
                reply.set_observe_value(sequence);
            } else {
                state.observers.deregister(&path, peer, request.get_token());
            }
        }
        if let Some(block) = block1 {
            let echoed = BlockValue { more: false, ..block };
            reply.set_block1(echoed);
        }

        let reply = match self.fit_block2(&mut state, peer, &request, reply) {
            Some(reply) => reply,
            None => Message::response_to(&request, Status::BadOption),
        };

        if separate {
            let mut reply = reply;
            reply.header.set_type(MessageType::Confirmable);
            if let Err(e) = self.transmit(&mut state, peer, reply, Origin::Response) {
                warn!("Could not send separate response to {}: {}", peer, e);
            }
        } else {
            self.reply(&mut state, peer, &request, reply);
        }
    }

    /// Cuts a response into Block2 blocks if it does not fit one block, or
    /// the client asked for a block. The whole response is cached for the
    /// follow-up requests.
    fn fit_block2(&self, state: &mut State, peer: SocketAddr, request: &Message, reply: Message) -> Option<Message> {
        let requested = match request.block2() {
            Some(Ok(block)) => Some(block),
            Some(Err(_)) => return None,
            None => None,
        };
        let size = match &requested {
            Some(block) => block.size().min(self.preferred_block_size()),
            None => self.preferred_block_size(),
        };
        if requested.is_none() && reply.payload.len() <= size {
            return Some(reply);
        }

        let num = match &requested {
            // A smaller size than the client asked for shifts the block number.
            Some(block) => block_offset(block) / size,
            None => 0,
        };
        let block = block_value(num, false, size).ok()?;
        let first = fragment_response(request, &reply, &block);
        state
            .blocks
            .cache_response(RequestCacheKey::new(request, peer), reply, self.now());
        first
    }

    async fn notify_observers(self: &Arc<Self>, path: &str) {
        let resource = self
            .resources
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned();
        let Some(resource) = resource else {
            debug!("notify_observers: no resource at {:?}", path);
            return;
        };

        let pending = self.lock().observers.resource_changed(path);
        for notification in pending {
            let peer = notification.peer;
            let token = notification.request.get_token().to_vec();
            let response = resource
                .handle(Request {
                    message: notification.request.clone(),
                    source: peer,
                })
                .await;

            let mut message = response.into_message(&notification.request);
            message.header.set_type(self.config.notification_type);
            let success = message.status().map_or(false, |s| !s.is_error());
            if success {
                message.set_observe_value(notification.sequence);
            }

            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            if !state.observers.is_observing(path, peer, &token) {
                continue;
            }
            let size = self.preferred_block_size();
            if message.payload.len() > size {
                let first = block_value(0, false, size)
                    .ok()
                    .and_then(|block| fragment_response(&notification.request, &message, &block));
                let key = RequestCacheKey::new(&notification.request, peer);
                state.blocks.cache_response(key, message.clone(), self.now());
                if let Some(mut first) = first {
                    first.header.set_type(message.header.get_type());
                    message = first;
                }
            }

            let origin = Origin::Notification {
                path: path.to_string(),
                token: token.clone(),
            };
            if let Err(e) = self.transmit(&mut state, peer, message, origin) {
                warn!("Could not notify {}: {}", peer, e);
            }
            if !success {
                state.observers.deregister(path, peer, &token);
            }
        }
    }

    fn housekeeping(self: &Arc<Self>) {
        let now = self.now();
        let lifetime = self.config.transmission.exchange_lifetime();
        let mut state = self.lock();

        state.dedup.prune(now);
        state.message_ids.retain(|_, ids| {
            ids.prune(now);
            !ids.is_empty()
        });
        state.observers.prune(now);
        state.blocks.prune(now);

        let mut peers = Vec::new();
        for (peer, token) in state.exchanges.expired(now, lifetime) {
            if let Some(entry) = self.close_exchange(&mut state, peer, &token) {
                debug!("Exchange {:?} with {} expired after {:?}", token, peer, lifetime);
                entry.emit(ExchangeEvent::TransmissionTimeout);
            }
            if !peers.contains(&peer) {
                peers.push(peer);
            }
        }
        for peer in peers {
            self.drain_queue(&mut state, peer);
        }
    }

    fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.scheduler.clear();
            for entry in state.exchanges.drain() {
                entry.emit(ExchangeEvent::Failed(CoapError::Shutdown));
            }
        }
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        debug!("Endpoint {} shut down", self.local_addr);
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        self.state
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .scheduler
            .clear();
    }
}

/// The request for the block after `received`, on the same token.
fn follow_up_request(original: &Message, received: &BlockValue) -> Option<Message> {
    let next = block_value(usize::from(received.num) + 1, false, received.size()).ok()?;
    let mut request = original.clone();
    request.payload.clear();
    request.clear_option(CoapOption::Block1);
    request.clear_option(CoapOption::Size1);
    request.clear_option(CoapOption::Observe);
    request.set_block2(next);
    Some(request)
}
