//! Message id and token allocation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{CoapError, Result};
use crate::message::MAX_TOKEN_LENGTH;

/// Hands out message ids toward one peer.
///
/// Ids are sequential, wrap at 2^16 and skip any id handed out less than
/// `lifetime` ago.
#[derive(Debug)]
pub struct MessageIdAllocator {
    next: u16,
    lifetime: Duration,
    reserved: HashMap<u16, Instant>,
}

impl MessageIdAllocator {
    pub fn new(lifetime: Duration) -> Self {
        Self::starting_at(rand::thread_rng().gen(), lifetime)
    }

    pub fn starting_at(first: u16, lifetime: Duration) -> Self {
        Self {
            next: first,
            lifetime,
            reserved: HashMap::new(),
        }
    }

    pub fn allocate(&mut self, now: Instant) -> Result<u16> {
        for _ in 0..=u16::MAX as u32 {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);

            let free = match self.reserved.get(&candidate) {
                Some(expires) => *expires <= now,
                None => true,
            };
            if free {
                self.reserved.insert(candidate, now + self.lifetime);
                return Ok(candidate);
            }
        }
        Err(CoapError::NoMessageIdAvailable)
    }

    pub fn is_reserved(&self, id: u16, now: Instant) -> bool {
        self.reserved.get(&id).map_or(false, |expires| *expires > now)
    }

    pub fn prune(&mut self, now: Instant) {
        self.reserved.retain(|_, expires| *expires > now);
    }

    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty()
    }
}

/// Number of fresh draws before giving up on finding an unused token.
pub const MAX_TOKEN_DRAWS: usize = 8;

#[derive(Debug, Clone)]
pub struct TokenGenerator {
    length: usize,
}

impl TokenGenerator {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.clamp(1, MAX_TOKEN_LENGTH),
        }
    }

    /// Draws random tokens until one is not `in_use`.
    pub fn generate<F>(&self, in_use: F) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_TOKEN_DRAWS {
            let token: Vec<u8> = (0..self.length).map(|_| rng.gen()).collect();
            if !in_use(&token) {
                return Ok(token);
            }
        }
        Err(CoapError::TokenExhausted)
    }
}
