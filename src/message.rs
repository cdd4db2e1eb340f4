//! The CoAP message model.
//!
//! Messages are [`coap_lite::Packet`]s. [`decode`] adds the checks a
//! message-layer receiver needs on top of `Packet::from_bytes`, and
//! [`MessageExt`] adds the constructors and typed accessors the endpoint uses.

use std::collections::LinkedList;

use coap_lite::error::IncompatibleOptionValueFormat;
use coap_lite::option_value::OptionValueU32;

pub use coap_lite::block_handler::BlockValue;
pub use coap_lite::{
    CoapOption, MessageClass, MessageType, ObserveOption, Packet as Message,
    RequestType as Method, ResponseType as Status,
};

use crate::error::FormatError;

pub const MAX_TOKEN_LENGTH: usize = 8;

/// Largest value the 24-bit Observe sequence can take.
pub const OBSERVE_SEQUENCE_MASK: u32 = 0x00FF_FFFF;

const COAP_VERSION: u8 = 1;
const RESERVED_SIZE_EXPONENT: u8 = 7;

/// Decodes one datagram.
///
/// Beyond what `Packet::from_bytes` checks, this rejects a version other
/// than 1, a payload marker with nothing after it, a 0.00 message with any
/// content, and critical options this endpoint does not know.
pub fn decode(buf: &[u8]) -> Result<Message, FormatError> {
    let message = Message::from_bytes(buf)?;

    let version = message.header.get_version();
    if version != COAP_VERSION {
        return Err(FormatError::InvalidVersion(version));
    }
    if message.header.code == MessageClass::Empty && buf.len() > 4 {
        return Err(FormatError::InvalidEmptyMessage);
    }
    for (number, _) in message.options() {
        if let CoapOption::Unknown(number) = CoapOption::from(*number) {
            if number & 0x01 == 0x01 {
                return Err(FormatError::UnknownCriticalOption(number));
            }
        }
    }
    // `from_bytes` reads a trailing marker as an empty payload.
    if message.payload.is_empty() && encode(&message)?.len() != buf.len() {
        return Err(FormatError::EmptyPayload);
    }
    Ok(message)
}

/// Encodes a message without the size cap of `Packet::to_bytes`; datagram
/// limits are the transport's concern.
pub fn encode(message: &Message) -> Result<Vec<u8>, FormatError> {
    Ok(message.to_bytes_unlimited()?)
}

fn checked_block(
    value: Result<BlockValue, IncompatibleOptionValueFormat>,
) -> Result<BlockValue, FormatError> {
    match value {
        Ok(block) if block.size_exponent < RESERVED_SIZE_EXPONENT => Ok(block),
        _ => Err(FormatError::InvalidBlockValue),
    }
}

/// Constructors and accessors on top of [`Message`].
pub trait MessageExt {
    fn request(method: Method, message_type: MessageType) -> Self;

    /// An empty ACK or RST answering `message_id`.
    fn empty(message_type: MessageType, message_id: u16) -> Self;

    /// A response skeleton for `request`: piggybacked ACK for a CON, NON otherwise.
    fn response_to(request: &Self, status: Status) -> Self;

    fn method(&self) -> Option<Method>;

    fn status(&self) -> Option<Status>;

    /// Responses include codes of classes 2 to 5 that have no registered meaning.
    fn is_response(&self) -> bool;

    /// Replaces every value of `option` with `value`.
    fn replace_option(&mut self, option: CoapOption, value: Vec<u8>);

    /// First value of an unsigned integer option.
    fn uint_option(&self, option: CoapOption) -> Option<u32>;

    fn set_path(&mut self, path: &str);

    /// The Uri-Path segments joined with `/`, without a leading slash.
    fn path(&self) -> String;

    fn observe_value(&self) -> Option<u32>;

    /// Interprets the Observe option of a request.
    fn observe_flag(&self) -> Option<ObserveOption>;

    fn block1(&self) -> Option<Result<BlockValue, FormatError>>;

    fn block2(&self) -> Option<Result<BlockValue, FormatError>>;

    fn set_block1(&mut self, block: BlockValue);

    fn set_block2(&mut self, block: BlockValue);
}

impl MessageExt for Message {
    fn request(method: Method, message_type: MessageType) -> Message {
        let mut message = Message::new();
        message.header.set_type(message_type);
        message.header.code = MessageClass::Request(method);
        message
    }

    fn empty(message_type: MessageType, message_id: u16) -> Message {
        let mut message = Message::new();
        message.header.set_type(message_type);
        message.header.code = MessageClass::Empty;
        message.header.message_id = message_id;
        message
    }

    fn response_to(request: &Message, status: Status) -> Message {
        let mut message = Message::new();
        if request.header.get_type() == MessageType::Confirmable {
            message.header.set_type(MessageType::Acknowledgement);
            message.header.message_id = request.header.message_id;
        } else {
            message.header.set_type(MessageType::NonConfirmable);
        }
        message.header.code = MessageClass::Response(status);
        message.set_token(request.get_token().to_vec());
        message
    }

    fn method(&self) -> Option<Method> {
        match self.header.code {
            MessageClass::Request(method) => Some(method),
            _ => None,
        }
    }

    fn status(&self) -> Option<Status> {
        match self.header.code {
            MessageClass::Response(status) => Some(status),
            _ => None,
        }
    }

    fn is_response(&self) -> bool {
        match self.header.code {
            MessageClass::Response(_) => true,
            MessageClass::Reserved(code) => (2..=5).contains(&(code >> 5)),
            _ => false,
        }
    }

    fn replace_option(&mut self, option: CoapOption, value: Vec<u8>) {
        let mut values = LinkedList::new();
        values.push_back(value);
        self.set_option(option, values);
    }

    fn uint_option(&self, option: CoapOption) -> Option<u32> {
        self.get_first_option_as::<OptionValueU32>(option)
            .and_then(|value| value.ok())
            .map(|value| value.0)
    }

    fn set_path(&mut self, path: &str) {
        let segments: LinkedList<Vec<u8>> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.as_bytes().to_vec())
            .collect();
        if segments.is_empty() {
            self.clear_option(CoapOption::UriPath);
        } else {
            self.set_option(CoapOption::UriPath, segments);
        }
    }

    fn path(&self) -> String {
        self.get_option(CoapOption::UriPath)
            .map(|segments| {
                segments
                    .iter()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }

    fn observe_value(&self) -> Option<u32> {
        self.uint_option(CoapOption::Observe)
            .map(|value| value & OBSERVE_SEQUENCE_MASK)
    }

    fn observe_flag(&self) -> Option<ObserveOption> {
        let value = self.observe_value()?;
        ObserveOption::try_from(value as usize).ok()
    }

    fn block1(&self) -> Option<Result<BlockValue, FormatError>> {
        self.get_first_option_as::<BlockValue>(CoapOption::Block1)
            .map(checked_block)
    }

    fn block2(&self) -> Option<Result<BlockValue, FormatError>> {
        self.get_first_option_as::<BlockValue>(CoapOption::Block2)
            .map(checked_block)
    }

    fn set_block1(&mut self, block: BlockValue) {
        self.replace_option(CoapOption::Block1, block.into());
    }

    fn set_block2(&mut self, block: BlockValue) {
        self.replace_option(CoapOption::Block2, block.into());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck::{Arbitrary, Gen, QuickCheck, TestResult};

    #[test]
    fn test_decode_packet_with_options() {
        let buf = [
            0x44, 0x01, 0x84, 0x9e, 0x51, 0x55, 0x77, 0xe8, 0xb2, 0x48, 0x69, 0x04, 0x54, 0x65,
            0x73, 0x74, 0x43, 0x61, 0x3d, 0x31,
        ];
        let message = decode(&buf).unwrap();
        assert_eq!(message.header.get_type(), MessageType::Confirmable);
        assert_eq!(message.header.code, MessageClass::Request(Method::Get));
        assert_eq!(message.header.message_id, 33950);
        assert_eq!(message.get_token(), &[0x51, 0x55, 0x77, 0xE8]);
        assert_eq!(message.path(), "Hi/Test");
        assert_eq!(
            message.get_first_option(CoapOption::UriQuery).unwrap(),
            b"a=1"
        );
    }

    #[test]
    fn test_encode_response_to() {
        let mut request = Message::request(Method::Get, MessageType::Confirmable);
        request.header.message_id = 5117;
        request.set_token(vec![0xD0, 0xE2, 0x4D, 0xAC]);
        let mut response = Message::response_to(&request, Status::Content);
        response.payload = b"Hello".to_vec();
        assert_eq!(
            encode(&response).unwrap(),
            vec![0x64, 0x45, 0x13, 0xFD, 0xD0, 0xE2, 0x4D, 0xAC, 0xFF, 0x48, 0x65, 0x6C, 0x6C, 0x6F]
        );

        request.header.set_type(MessageType::NonConfirmable);
        let response = Message::response_to(&request, Status::Content);
        assert_eq!(response.header.get_type(), MessageType::NonConfirmable);
        assert_eq!(response.header.message_id, 0);
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(decode(&[0x40, 0x01]), Err(FormatError::InvalidHeader));
        assert_eq!(
            decode(&[0x80, 0x01, 0x00, 0x01]),
            Err(FormatError::InvalidVersion(2))
        );
        assert_eq!(
            decode(&[0x49, 0x01, 0x00, 0x01]),
            Err(FormatError::InvalidTokenLength)
        );
        assert_eq!(
            decode(&[0x44, 0x01, 0x00, 0x01, 0xAA]),
            Err(FormatError::InvalidTokenLength)
        );
        // Uri-Path declaring 5 bytes with only 2 present.
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xB5, b'a', b'b']),
            Err(FormatError::InvalidOptionLength)
        );
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xF0]),
            Err(FormatError::InvalidOptionDelta)
        );
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xFF]),
            Err(FormatError::EmptyPayload)
        );
        assert_eq!(
            decode(&[0x41, 0x00, 0x00, 0x01, 0x01]),
            Err(FormatError::InvalidEmptyMessage)
        );
        // Option 13 is critical and unassigned.
        assert_eq!(
            decode(&[0x40, 0x01, 0x00, 0x01, 0xD0, 0x00]),
            Err(FormatError::UnknownCriticalOption(13))
        );
    }

    #[test]
    fn test_option_value_ending_in_marker_byte() {
        let mut message = Message::request(Method::Get, MessageType::Confirmable);
        message.add_option(CoapOption::ETag, vec![0x01, 0xFF]);
        let bytes = encode(&message).unwrap();
        assert_eq!(*bytes.last().unwrap(), 0xFF);
        assert_eq!(decode(&bytes).unwrap(), message);
    }

    #[test]
    fn test_unknown_elective_option_is_kept() {
        let bytes = [0x40, 0x01, 0x00, 0x01, 0xA1, 0x07];
        let message = decode(&bytes).unwrap();
        assert_eq!(
            message.get_first_option(CoapOption::Unknown(10)).unwrap(),
            &vec![7]
        );
    }

    #[test]
    fn test_observe_and_block_accessors() {
        let mut message = Message::request(Method::Get, MessageType::Confirmable);
        message.set_observe_value(0x1_000_005);
        assert_eq!(message.observe_value(), Some(5));
        message.set_observe_value(1);
        assert_eq!(message.observe_flag(), Some(ObserveOption::Deregister));

        let block = BlockValue::new(3, true, 64).unwrap();
        message.set_block2(block.clone());
        assert_eq!(message.block2().unwrap().unwrap(), block);
        assert!(message.block1().is_none());

        // SZX 7 is reserved.
        message.replace_option(CoapOption::Block1, vec![0x07]);
        assert_eq!(message.block1(), Some(Err(FormatError::InvalidBlockValue)));
    }

    #[test]
    fn test_path_round_trip() {
        let mut message = Message::request(Method::Put, MessageType::Confirmable);
        message.set_path("/sensors//temp/");
        assert_eq!(message.path(), "sensors/temp");
        message.set_path("/");
        assert_eq!(message.path(), "");
    }

    #[derive(Clone, Debug)]
    struct ArbitraryMessage(Message);

    const ARBITRARY_OPTIONS: [CoapOption; 12] = [
        CoapOption::IfMatch,
        CoapOption::UriHost,
        CoapOption::ETag,
        CoapOption::Observe,
        CoapOption::UriPath,
        CoapOption::ContentFormat,
        CoapOption::UriQuery,
        CoapOption::Block2,
        CoapOption::Block1,
        CoapOption::ProxyUri,
        CoapOption::NoResponse,
        CoapOption::Unknown(2048),
    ];

    impl Arbitrary for ArbitraryMessage {
        fn arbitrary(g: &mut Gen) -> Self {
            let message_type = *g
                .choose(&[
                    MessageType::Confirmable,
                    MessageType::NonConfirmable,
                    MessageType::Acknowledgement,
                    MessageType::Reset,
                ])
                .unwrap();
            let code = u8::arbitrary(g);
            if code == 0 {
                return ArbitraryMessage(Message::empty(message_type, u16::arbitrary(g)));
            }

            let mut message = Message::new();
            message.header.set_type(message_type);
            message.header.message_id = u16::arbitrary(g);
            message.header.code = MessageClass::from(code);

            let token_length = usize::arbitrary(g) % (MAX_TOKEN_LENGTH + 1);
            message.set_token((0..token_length).map(|_| u8::arbitrary(g)).collect());

            let option_count = usize::arbitrary(g) % 6;
            for _ in 0..option_count {
                let option = *g.choose(&ARBITRARY_OPTIONS).unwrap();
                let length = usize::arbitrary(g) % 300;
                let value = (0..length).map(|_| u8::arbitrary(g)).collect();
                message.add_option(option, value);
            }
            message.payload = Vec::<u8>::arbitrary(g);
            ArbitraryMessage(message)
        }
    }

    #[test]
    fn test_round_trip() {
        fn run(message: ArbitraryMessage) -> bool {
            let message = message.0;
            decode(&encode(&message).unwrap()) == Ok(message)
        }
        QuickCheck::new()
            .tests(2000)
            .quickcheck(run as fn(ArbitraryMessage) -> bool)
    }

    #[test]
    fn test_malicious_packet() {
        fn run(x: Vec<u8>) -> TestResult {
            match decode(&x[..]) {
                Ok(message) => TestResult::from_bool(
                    message.get_token().len() == (x[0] & 0x0F) as usize
                        && decode(&encode(&message).unwrap()).is_ok(),
                ),
                Err(_) => TestResult::passed(),
            }
        }
        QuickCheck::new()
            .tests(10000)
            .gen(Gen::new(1500))
            .quickcheck(run as fn(Vec<u8>) -> TestResult)
    }
}
