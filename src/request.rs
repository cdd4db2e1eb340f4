use coap_lite::option_value::OptionValueU16;
use log::warn;

use crate::message::{CoapOption, Message, MessageExt, MessageType, Method, MAX_TOKEN_LENGTH};

/// A builder for outbound requests.
///
/// The message id is left for the endpoint to assign. Without an explicit
/// token, the endpoint draws one that is unused toward the peer.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    message: Message,
    host: Option<String>,
    queries: Vec<Vec<u8>>,
    extra: Vec<(CoapOption, Vec<u8>)>,
}

impl RequestBuilder {
    pub fn new(path: &str, method: Method) -> Self {
        let mut message = Message::request(method, MessageType::Confirmable);
        message.set_path(path);
        Self {
            message,
            host: None,
            queries: Vec::new(),
            extra: Vec::new(),
        }
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.message.payload = payload;
        self
    }

    /// Adds one Uri-Query value, e.g. `"unit=c"`.
    pub fn query(mut self, query: impl Into<Vec<u8>>) -> Self {
        self.queries.push(query.into());
        self
    }

    /// Sets Uri-Host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn confirmable(mut self, confirmable: bool) -> Self {
        self.message.header.set_type(if confirmable {
            MessageType::Confirmable
        } else {
            MessageType::NonConfirmable
        });
        self
    }

    /// Uses `token` instead of a generated one. A token longer than eight
    /// bytes is cut to its first eight.
    pub fn token(mut self, mut token: Vec<u8>) -> Self {
        if token.len() > MAX_TOKEN_LENGTH {
            warn!(
                "Token of {} bytes truncated to {}",
                token.len(),
                MAX_TOKEN_LENGTH
            );
            token.truncate(MAX_TOKEN_LENGTH);
        }
        self.message.set_token(token);
        self
    }

    pub fn content_format(self, format: u16) -> Self {
        self.option(CoapOption::ContentFormat, OptionValueU16(format).into())
    }

    /// Adds an arbitrary option. Uri-Path, Uri-Query and Uri-Host are set
    /// through their own methods and are skipped here.
    pub fn option(mut self, option: CoapOption, value: Vec<u8>) -> Self {
        match option {
            CoapOption::UriPath | CoapOption::UriQuery | CoapOption::UriHost => {}
            _ => self.extra.push((option, value)),
        }
        self
    }

    pub fn build(self) -> Message {
        let mut message = self.message;
        if let Some(host) = self.host.filter(|h| !h.is_empty()) {
            message.replace_option(CoapOption::UriHost, host.into_bytes());
        }
        for query in self.queries {
            message.add_option(CoapOption::UriQuery, query);
        }
        for (option, value) in self.extra {
            message.add_option(option, value);
        }
        message
    }
}
