//! What the application plugs into an [`Endpoint`](crate::Endpoint) to serve
//! requests.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::message::{CoapOption, Message, MessageExt, Method, Status};

/// An inbound request handed to a [`Resource`].
#[derive(Debug, Clone)]
pub struct Request {
    /// The request, with a block-wise body already reassembled.
    pub message: Message,
    pub source: SocketAddr,
}

impl Request {
    pub fn method(&self) -> Option<Method> {
        self.message.method()
    }

    pub fn path(&self) -> String {
        self.message.path()
    }

    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    /// Uri-Query values, lossily decoded.
    pub fn queries(&self) -> Vec<String> {
        self.message
            .get_option(CoapOption::UriQuery)
            .map(|values| {
                values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub status: Status,
    pub payload: Vec<u8>,
    options: Vec<(CoapOption, Vec<u8>)>,
}

impl Default for Response {
    fn default() -> Self {
        Response::new()
    }
}

impl Response {
    pub fn new() -> Self {
        Self {
            status: Status::Content,
            payload: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn set_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn set_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn add_option(mut self, option: CoapOption, value: Vec<u8>) -> Self {
        self.options.push((option, value));
        self
    }

    /// Builds the response message answering `request`: a piggybacked ACK for
    /// a CON, a NON otherwise.
    pub fn into_message(self, request: &Message) -> Message {
        let mut message = Message::response_to(request, self.status);
        for (option, value) in self.options {
            message.add_option(option, value);
        }
        message.payload = self.payload;
        message
    }
}

/// Types a handler closure may return.
pub trait IntoResponse {
    fn into_response(self) -> Response;
}

impl IntoResponse for Response {
    fn into_response(self) -> Response {
        self
    }
}

impl IntoResponse for Status {
    fn into_response(self) -> Response {
        Response::new().set_status(self)
    }
}

impl IntoResponse for () {
    fn into_response(self) -> Response {
        Response::new()
    }
}

impl IntoResponse for Infallible {
    fn into_response(self) -> Response {
        match self {}
    }
}

impl<T: IntoResponse, E: IntoResponse> IntoResponse for Result<T, E> {
    fn into_response(self) -> Response {
        match self {
            Ok(value) => value.into_response(),
            Err(err) => err.into_response(),
        }
    }
}

impl IntoResponse for Vec<u8> {
    fn into_response(self) -> Response {
        Response::new().set_payload(self)
    }
}

impl IntoResponse for &[u8] {
    fn into_response(self) -> Response {
        self.to_vec().into_response()
    }
}

impl IntoResponse for String {
    fn into_response(self) -> Response {
        self.into_bytes().into_response()
    }
}

impl IntoResponse for &str {
    fn into_response(self) -> Response {
        self.as_bytes().into_response()
    }
}

/// A server-side resource.
///
/// Handlers run on their own task, so they may take as long as they need;
/// when they outlast the piggyback window the endpoint acknowledges the
/// request and sends the response separately.
#[async_trait]
pub trait Resource: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Response;

    /// Whether GET requests carrying Observe may register here.
    fn is_observable(&self) -> bool {
        false
    }
}

#[async_trait]
impl<F, Fut, R> Resource for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send,
    R: IntoResponse + Send,
{
    async fn handle(&self, request: Request) -> Response {
        (self)(request).await.into_response()
    }
}

/// Makes the wrapped resource observable.
pub struct Observable<R>(pub R);

#[async_trait]
impl<R: Resource> Resource for Observable<R> {
    async fn handle(&self, request: Request) -> Response {
        self.0.handle(request).await
    }

    fn is_observable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::{MessageClass, MessageType};

    fn request(method: Method) -> Request {
        let mut message = Message::request(method, MessageType::Confirmable);
        message.header.message_id = 33;
        message.set_token(vec![7]);
        message.set_path("/sensors/temp");
        message.add_option(CoapOption::UriQuery, b"unit=c".to_vec());
        Request {
            message,
            source: "127.0.0.1:5683".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_closure_resource() {
        let resource = |request: Request| async move {
            match request.method() {
                Some(Method::Get) => Ok(format!("{}?{}", request.path(), request.queries()[0])),
                _ => Err(Status::MethodNotAllowed),
            }
        };
        assert!(!resource.is_observable());

        let response = resource.handle(request(Method::Get)).await;
        assert_eq!(response.status, Status::Content);
        assert_eq!(response.payload, b"sensors/temp?unit=c");

        let response = resource.handle(request(Method::Delete)).await;
        assert_eq!(response.status, Status::MethodNotAllowed);
    }

    #[tokio::test]
    async fn test_observable_wrapper() {
        let resource = Observable(|_request: Request| async { "22.5" });
        assert!(resource.is_observable());
        assert_eq!(resource.handle(request(Method::Get)).await.payload, b"22.5");
    }

    #[test]
    fn test_into_message_piggybacks() {
        let req = request(Method::Get);
        let message = Response::new()
            .set_status(Status::Changed)
            .add_option(CoapOption::ContentFormat, vec![0])
            .set_payload(b"ok".to_vec())
            .into_message(&req.message);
        assert_eq!(message.header.get_type(), MessageType::Acknowledgement);
        assert_eq!(message.header.message_id, 33);
        assert_eq!(message.get_token(), &[7]);
        assert_eq!(message.header.code, MessageClass::Response(Status::Changed));
        assert_eq!(message.get_first_option(CoapOption::ContentFormat), Some(&vec![0u8]));
    }
}
