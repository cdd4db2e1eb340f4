//! A CoAP message-exchange engine.
//!
//! This library provides an [`Endpoint`] that acts as client and server at
//! once over a datagram [`Transport`] (UDP by default).
//!
//! Features:
//! - CoAP core protocol [RFC 7252](https://tools.ietf.org/rfc/rfc7252.txt):
//!   confirmable retransmission with randomized backoff, deduplication,
//!   piggybacked and separate responses
//! - CoAP Observe option [RFC 7641](https://tools.ietf.org/rfc/rfc7641.txt)
//! - Block-Wise Transfers [RFC 7959](https://tools.ietf.org/html/rfc7959)
//! - Option to provide custom transports
//!
//! Missing features:
//! - DTLS
//! - Proxying
//!
//! # Installation
//!
//! First add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! coap-exchange = "0.1"
//! tokio = {version = "^1.32", features = ["full"]}
//! ```
//!
//! # Example
//!
//! ## Server:
//! ```no_run
//! use coap_exchange::{Endpoint, EndpointConfig, Method, Request, Status};
//!
//! #[tokio::main]
//! async fn main() {
//!     let endpoint = Endpoint::bind("127.0.0.1:5683", EndpointConfig::default())
//!         .await
//!         .unwrap();
//!     println!("Server up on {}", endpoint.local_addr());
//!
//!     endpoint.add_resource("/Rust", |request: Request| async move {
//!         match request.method() {
//!             Some(Method::Get) => Ok("OK"),
//!             _ => Err(Status::MethodNotAllowed),
//!         }
//!     });
//!
//!     tokio::signal::ctrl_c().await.unwrap();
//!     endpoint.shutdown();
//! }
//! ```
//!
//! ## Client:
//! ```no_run
//! use coap_exchange::{Endpoint, EndpointConfig, Method, RequestBuilder};
//!
//! #[tokio::main]
//! async fn main() {
//!     let endpoint = Endpoint::bind("0.0.0.0:0", EndpointConfig::default())
//!         .await
//!         .unwrap();
//!     let request = RequestBuilder::new("/Rust", Method::Get).build();
//!
//!     let exchange = endpoint
//!         .request("127.0.0.1:5683".parse().unwrap(), request)
//!         .unwrap();
//!     let response = exchange.response().await.unwrap();
//!     println!("Server reply: {}", String::from_utf8_lossy(&response.payload));
//! }
//! ```

#[cfg(test)]
extern crate quickcheck;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

pub use self::config::{EndpointConfig, TransmissionParameters};
pub use self::endpoint::Endpoint;
pub use self::error::{CoapError, FormatError, Result};
pub use self::exchange::{Exchange, ExchangeEvent, Observation};
pub use self::message::{
    BlockValue, CoapOption, Message, MessageClass, MessageExt, MessageType, Method, ObserveOption,
    Status,
};
pub use self::observer::{is_fresher, ObservationState};
pub use self::request::RequestBuilder;
pub use self::server::{IntoResponse, Observable, Request, Resource, Response};
pub use self::transport::Transport;

pub mod block;
pub mod config;
pub mod dedup;
mod endpoint;
pub mod error;
mod exchange;
pub mod ids;
pub mod message;
pub mod observer;
mod request;
pub mod retransmit;
mod server;
mod transport;

/// Frames whole datagrams as [`Message`]s.
///
/// Each call to `decode` consumes the entire buffer, so a malformed datagram
/// never leaves bytes behind to corrupt the next one.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CoapError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>> {
        if buf.is_empty() {
            return Ok(None);
        }
        let datagram = buf.split_to(buf.len());
        Ok(Some(message::decode(&datagram)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CoapError;

    fn encode(&mut self, item: Message, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&message::encode(&item)?);
        Ok(())
    }
}
