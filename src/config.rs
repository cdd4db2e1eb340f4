use std::time::Duration;

use crate::message::MessageType;

/// The CoAP transmission parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransmissionParameters {
    /// Lower bound of the first retransmission timeout.
    pub ack_timeout: Duration,
    pub ack_random_factor: f64,
    /// Retransmissions after the first transmission.
    pub max_retransmit: u32,
    /// Outstanding confirmable messages allowed per peer.
    pub nstart: usize,
    pub max_latency: Duration,
    pub processing_delay: Duration,
}

impl Default for TransmissionParameters {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            max_retransmit: 4,
            nstart: 1,
            max_latency: Duration::from_secs(100),
            processing_delay: Duration::from_secs(2),
        }
    }
}

impl TransmissionParameters {
    /// Upper bound of the first retransmission timeout.
    pub fn max_initial_timeout(&self) -> Duration {
        self.ack_timeout.mul_f64(self.ack_random_factor)
    }

    /// Time from the first to the last transmission of a confirmable message.
    pub fn max_transmit_span(&self) -> Duration {
        let doublings = (1u32 << self.max_retransmit) - 1;
        self.max_initial_timeout() * doublings
    }

    /// Time from the first transmission until the sender gives up waiting for an ACK.
    pub fn max_transmit_wait(&self) -> Duration {
        let doublings = (1u32 << (self.max_retransmit + 1)) - 1;
        self.max_initial_timeout() * doublings
    }

    /// How long a message id stays reserved and a duplicate stays detectable.
    pub fn exchange_lifetime(&self) -> Duration {
        self.max_transmit_span() + self.max_latency * 2 + self.processing_delay
    }
}

/// Configuration for an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub transmission: TransmissionParameters,
    /// Length of generated tokens, 1 to 8 bytes.
    pub token_length: usize,
    /// Preferred block size for outbound block-wise transfers. Rounded down
    /// to a power of two between 16 and 1024.
    pub block_size: usize,
    /// Largest body accepted through Block1 reassembly.
    pub max_body_size: usize,
    /// How long a handler may run before an empty ACK is sent and the
    /// response follows separately.
    pub piggyback_window: Duration,
    pub notification_type: MessageType,
    pub housekeeping_interval: Duration,
    pub max_datagram_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            transmission: TransmissionParameters::default(),
            token_length: 4,
            block_size: 1024,
            max_body_size: 64 * 1024,
            piggyback_window: Duration::from_millis(1000),
            notification_type: MessageType::Confirmable,
            housekeeping_interval: Duration::from_secs(1),
            max_datagram_size: 1600,
        }
    }
}
