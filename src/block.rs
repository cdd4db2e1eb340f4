//! Block-wise transfers (RFC 7959).
//!
//! [`Fragmenter`] walks an outbound body block by block, [`Reassembler`]
//! collects an inbound one, and [`BlockwiseManager`] keeps the per-peer
//! reassembly buffers and the cache of large responses served through Block2.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use coap_lite::option_value::OptionValueU32;
use log::debug;

use crate::error::{CoapError, FormatError, Result};
use crate::message::{BlockValue, CoapOption, Message, MessageClass, MessageExt, Status};

pub const MIN_BLOCK_SIZE: usize = 16;
pub const MAX_BLOCK_SIZE: usize = 1024;
/// Highest block number a two-byte Block option value can carry.
pub const MAX_BLOCK_NUM: usize = 0x0FFF;

/// Rounds `size` down to a power of two a Block option can express.
pub fn block_size(size: usize) -> usize {
    let size = size.clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE);
    1 << (usize::BITS - 1 - size.leading_zeros())
}

pub fn block_value(num: usize, more: bool, size: usize) -> Result<BlockValue> {
    if num > MAX_BLOCK_NUM {
        return Err(FormatError::InvalidBlockValue.into());
    }
    BlockValue::new(num, more, block_size(size)).map_err(|_| FormatError::InvalidBlockValue.into())
}

/// Byte offset of `block` inside the whole body.
pub fn block_offset(block: &BlockValue) -> usize {
    usize::from(block.num) * block.size()
}

/// Splits a body into blocks, letting the peer shrink the block size on the way.
#[derive(Debug, Clone)]
pub struct Fragmenter {
    payload: Vec<u8>,
    offset: usize,
    size: usize,
}

impl Fragmenter {
    /// Fails with `BodyTooLarge` when the body needs more blocks of `size`
    /// than a block number can count.
    pub fn new(payload: Vec<u8>, size: usize) -> Result<Self> {
        let size = block_size(size);
        if payload.len() > (MAX_BLOCK_NUM + 1) * size {
            return Err(CoapError::BodyTooLarge(payload.len()));
        }
        Ok(Self {
            payload,
            offset: 0,
            size,
        })
    }

    /// Whether `len` bytes need more than one block of `size`.
    pub fn needs_fragmentation(len: usize, size: usize) -> bool {
        len > block_size(size)
    }

    pub fn total_len(&self) -> usize {
        self.payload.len()
    }

    /// The block at the current offset and its bytes.
    pub fn current(&self) -> Result<(BlockValue, &[u8])> {
        let end = (self.offset + self.size).min(self.payload.len());
        let block = block_value(self.offset / self.size, end < self.payload.len(), self.size)?;
        Ok((block, &self.payload[self.offset..end]))
    }

    /// Moves past the block the peer just confirmed. `confirmed` is the Block1
    /// value echoed in the 2.31 Continue. Returns true while blocks remain.
    pub fn advance(&mut self, confirmed: &BlockValue) -> Result<bool> {
        let requested = confirmed.size();
        if requested > self.size {
            return Err(CoapError::BlockSizeGrowth {
                current: self.size,
                requested,
            });
        }
        let expected = self.offset / self.size;
        if usize::from(confirmed.num) != expected {
            return Err(CoapError::BlockSequence {
                expected: expected as u32,
                received: u32::from(confirmed.num),
            });
        }

        self.offset = (self.offset + self.size).min(self.payload.len());
        if requested < self.size {
            debug!("peer reduced block size from {} to {}", self.size, requested);
            self.size = requested;
        }
        Ok(self.offset < self.payload.len())
    }
}

/// Collects consecutive blocks into one body.
#[derive(Debug, Clone)]
pub struct Reassembler {
    buffer: Vec<u8>,
    size: Option<usize>,
    max_body_size: usize,
}

impl Reassembler {
    pub fn new(max_body_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            size: None,
            max_body_size,
        }
    }

    /// Appends a block. Returns the whole body once the last block arrived.
    pub fn push(&mut self, block: &BlockValue, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(size) = self.size {
            if block.size() > size {
                return Err(CoapError::BlockSizeGrowth {
                    current: size,
                    requested: block.size(),
                });
            }
        }
        if block_offset(block) != self.buffer.len() {
            return Err(CoapError::BlockSequence {
                expected: (self.buffer.len() / block.size()) as u32,
                received: u32::from(block.num),
            });
        }
        if block.more && payload.len() != block.size() {
            return Err(FormatError::InvalidBlockValue.into());
        }

        let total = self.buffer.len() + payload.len();
        if total > self.max_body_size {
            return Err(CoapError::BodyTooLarge(total));
        }

        self.buffer.extend_from_slice(payload);
        self.size = Some(block.size());

        if block.more {
            Ok(None)
        } else {
            Ok(Some(std::mem::take(&mut self.buffer)))
        }
    }
}

/// Identifies a cached large response: same method and path from the same peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestCacheKey {
    /// Request code as an integer, to keep the key plain data.
    request_code: u8,
    path: String,
    requester: SocketAddr,
}

impl RequestCacheKey {
    pub fn new(request: &Message, requester: SocketAddr) -> Self {
        Self {
            request_code: u8::from(request.header.code),
            path: request.path(),
            requester,
        }
    }
}

#[derive(Debug)]
struct CachedResponse {
    response: Message,
    inserted: Instant,
}

#[derive(Debug)]
struct ReassemblyItem {
    reassembler: Reassembler,
    touched: Instant,
}

/// Per-endpoint block-wise state.
#[derive(Debug)]
pub struct BlockwiseManager {
    reassembly: HashMap<(SocketAddr, Vec<u8>), ReassemblyItem>,
    responses: HashMap<RequestCacheKey, CachedResponse>,
    lifetime: Duration,
    max_body_size: usize,
}

impl BlockwiseManager {
    pub fn new(lifetime: Duration, max_body_size: usize) -> Self {
        Self {
            reassembly: HashMap::new(),
            responses: HashMap::new(),
            lifetime,
            max_body_size,
        }
    }

    /// Feeds one inbound block of the transfer on `(peer, token)`. The buffer
    /// is dropped on completion and on any error.
    pub fn reassemble(
        &mut self,
        peer: SocketAddr,
        token: &[u8],
        block: &BlockValue,
        payload: &[u8],
        now: Instant,
    ) -> Result<Option<Vec<u8>>> {
        let key = (peer, token.to_vec());
        if block.num == 0 {
            // A first block always starts over, even if an earlier transfer was left open.
            self.reassembly.remove(&key);
        }
        let max_body_size = self.max_body_size;
        let item = self.reassembly.entry(key.clone()).or_insert_with(|| ReassemblyItem {
            reassembler: Reassembler::new(max_body_size),
            touched: now,
        });
        item.touched = now;

        match item.reassembler.push(block, payload) {
            Ok(None) => Ok(None),
            Ok(Some(body)) => {
                self.reassembly.remove(&key);
                Ok(Some(body))
            }
            Err(e) => {
                debug!("block-wise transfer from {} aborted: {}", peer, e);
                self.reassembly.remove(&key);
                Err(e)
            }
        }
    }

    pub fn discard(&mut self, peer: SocketAddr, token: &[u8]) {
        self.reassembly.remove(&(peer, token.to_vec()));
    }

    pub fn is_reassembling(&self, peer: SocketAddr, token: &[u8]) -> bool {
        self.reassembly.contains_key(&(peer, token.to_vec()))
    }

    pub fn cache_response(&mut self, key: RequestCacheKey, response: Message, now: Instant) {
        self.responses.insert(
            key,
            CachedResponse {
                response,
                inserted: now,
            },
        );
    }

    /// Serves block `requested` of a cached response to `request`. `None`
    /// when nothing is cached or the block lies beyond the body.
    pub fn cached_block(
        &self,
        key: &RequestCacheKey,
        request: &Message,
        requested: &BlockValue,
    ) -> Option<Message> {
        let cached = self.responses.get(key)?;
        fragment_response(request, &cached.response, requested)
    }

    pub fn prune(&mut self, now: Instant) {
        let lifetime = self.lifetime;
        self.reassembly
            .retain(|_, item| now.duration_since(item.touched) < lifetime);
        self.responses
            .retain(|_, cached| now.duration_since(cached.inserted) < lifetime);
    }
}

/// Cuts block `requested` out of the complete response `full` and addresses
/// it to `request`. Carries Block2 and, on the first block, Size2.
pub fn fragment_response(request: &Message, full: &Message, requested: &BlockValue) -> Option<Message> {
    let size = requested.size();
    let start = block_offset(requested);
    if start > full.payload.len() || (start == full.payload.len() && start != 0) {
        return None;
    }
    let end = (start + size).min(full.payload.len());

    let status = full.status().unwrap_or(Status::Content);
    let mut response = Message::response_to(request, status);
    response.header.code = full.header.code;
    for (number, values) in full.options() {
        let option = CoapOption::from(*number);
        if !matches!(option, CoapOption::Block2 | CoapOption::Size2 | CoapOption::Observe) {
            response.set_option(option, values.clone());
        }
    }
    if let Some(observe) = full.get_first_option(CoapOption::Observe) {
        if requested.num == 0 {
            response.replace_option(CoapOption::Observe, observe.clone());
        }
    }
    let block = block_value(usize::from(requested.num), end < full.payload.len(), size).ok()?;
    response.set_block2(block);
    if requested.num == 0 {
        response.add_option_as(CoapOption::Size2, OptionValueU32(full.payload.len() as u32));
    }
    response.payload = full.payload[start..end].to_vec();
    Some(response)
}

/// Builds the 2.31 Continue that acknowledges an intermediate Block1 block.
pub fn continue_response(request: &Message, block: BlockValue) -> Message {
    let mut response = Message::response_to(request, Status::Continue);
    response.set_block1(block);
    response
}

/// Whether `message` is a 2.31 Continue.
pub fn is_continue(message: &Message) -> bool {
    message.header.code == MessageClass::Response(Status::Continue)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MessageType, Method};

    fn peer() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    fn body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn block(num: usize, more: bool, size: usize) -> BlockValue {
        block_value(num, more, size).unwrap()
    }

    #[test]
    fn test_block_size_rounding() {
        assert_eq!(block_size(1500), 1024);
        assert_eq!(block_size(100), 64);
        assert_eq!(block_size(4), 16);
        assert_eq!(block_size(512), 512);
    }

    #[test]
    fn test_block_value_limits() {
        let last = block(MAX_BLOCK_NUM, false, 16);
        assert_eq!(block_offset(&last), MAX_BLOCK_NUM * 16);
        assert!(block_value(MAX_BLOCK_NUM + 1, false, 16).is_err());
        assert!(matches!(
            Fragmenter::new(body((MAX_BLOCK_NUM + 1) * 16 + 1), 16),
            Err(CoapError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn test_fragment_and_reassemble() {
        let payload = body(64 * 7 / 2);
        let mut fragmenter = Fragmenter::new(payload.clone(), 64).unwrap();
        let mut reassembler = Reassembler::new(usize::MAX);

        let mut blocks = 0;
        let result = loop {
            let (block, bytes) = fragmenter.current().unwrap();
            blocks += 1;
            if let Some(full) = reassembler.push(&block, bytes).unwrap() {
                break full;
            }
            assert!(fragmenter.advance(&block).unwrap());
        };
        assert_eq!(blocks, 4);
        assert_eq!(result, payload);
    }

    #[test]
    fn test_out_of_order_block_aborts() {
        let payload = body(48);
        let mut manager = BlockwiseManager::new(Duration::from_secs(247), 1024);
        let now = Instant::now();

        assert_eq!(
            manager
                .reassemble(peer(), b"t", &block(0, true, 16), &payload[..16], now)
                .unwrap(),
            None
        );
        match manager.reassemble(peer(), b"t", &block(2, false, 16), &payload[32..], now) {
            Err(CoapError::BlockSequence { expected, received }) => {
                assert_eq!(expected, 1);
                assert_eq!(received, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!manager.is_reassembling(peer(), b"t"));
    }

    #[test]
    fn test_second_block_first_aborts() {
        let mut reassembler = Reassembler::new(1024);
        assert!(matches!(
            reassembler.push(&block(1, true, 16), &[0; 16]),
            Err(CoapError::BlockSequence {
                expected: 0,
                received: 1
            })
        ));
    }

    #[test]
    fn test_peer_shrinks_block_size() {
        let mut fragmenter = Fragmenter::new(body(100), 64).unwrap();
        let (first, bytes) = fragmenter.current().unwrap();
        assert_eq!(bytes.len(), 64);
        assert_eq!(first.num, 0);

        // The server answers block 0 with SZX 32: continue at offset 64 = block 2.
        assert!(fragmenter.advance(&block(0, true, 32)).unwrap());
        let (next, bytes) = fragmenter.current().unwrap();
        assert_eq!(next.num, 2);
        assert_eq!(next.size(), 32);
        assert_eq!(bytes.len(), 32);
    }

    #[test]
    fn test_block_size_growth_is_an_error() {
        let mut fragmenter = Fragmenter::new(body(100), 32).unwrap();
        assert!(matches!(
            fragmenter.advance(&block(0, true, 64)),
            Err(CoapError::BlockSizeGrowth {
                current: 32,
                requested: 64
            })
        ));
    }

    #[test]
    fn test_body_too_large() {
        let mut reassembler = Reassembler::new(20);
        reassembler.push(&block(0, true, 16), &[0; 16]).unwrap();
        assert!(matches!(
            reassembler.push(&block(1, true, 16), &[0; 16]),
            Err(CoapError::BodyTooLarge(32))
        ));
    }

    #[test]
    fn test_cached_response_blocks() {
        let mut request = Message::request(Method::Get, MessageType::Confirmable);
        request.header.message_id = 7;
        request.set_path("large");
        let mut full = Message::response_to(&request, Status::Content);
        full.payload = body(40);

        let mut manager = BlockwiseManager::new(Duration::from_secs(247), 1024);
        let key = RequestCacheKey::new(&request, peer());
        manager.cache_response(key.clone(), full.clone(), Instant::now());

        let first = manager
            .cached_block(&key, &request, &block(0, false, 16))
            .unwrap();
        assert_eq!(first.payload, full.payload[..16]);
        assert!(first.block2().unwrap().unwrap().more);
        assert_eq!(first.uint_option(CoapOption::Size2), Some(40));

        let last = manager
            .cached_block(&key, &request, &block(2, false, 16))
            .unwrap();
        assert_eq!(last.payload, full.payload[32..]);
        assert!(!last.block2().unwrap().unwrap().more);

        assert!(manager
            .cached_block(&key, &request, &block(3, false, 16))
            .is_none());
    }
}
