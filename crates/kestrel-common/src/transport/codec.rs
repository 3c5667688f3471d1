use crate::config::SerializerKind;
use crate::protocol::{RpcRequest, RpcResponse, TransportError};

/// Maximum frame body size (100 MB)
pub const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

const TAG_JSON: u8 = 1;
const TAG_POSTCARD: u8 = 2;

/// Codec for encoding/decoding RPC envelopes.
///
/// Every encoded envelope starts with a one-byte format tag so the receiver
/// can decode it without knowing in advance which codec the sender used.
/// Servers reply with the codec the request arrived in.
///
/// # Example
///
/// ```
/// use kestrel_common::transport::Codec;
/// use kestrel_common::protocol::RpcRequest;
///
/// let codec = Codec::postcard();
/// let request = RpcRequest::builder("UserService", "getUser").param(&7u32).unwrap().build();
///
/// let encoded = codec.encode_request(&request).unwrap();
/// assert_eq!(Codec::detect(&encoded).unwrap(), codec);
/// assert_eq!(Codec::decode_request(&encoded).unwrap(), request);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// JSON via serde_json
    Json(JsonCodec),
    /// Compact binary via postcard
    Postcard(PostcardCodec),
}

impl Codec {
    pub fn json() -> Self {
        Codec::Json(JsonCodec)
    }

    pub fn postcard() -> Self {
        Codec::Postcard(PostcardCodec)
    }

    pub fn from_kind(kind: SerializerKind) -> Self {
        match kind {
            SerializerKind::Json => Self::json(),
            SerializerKind::Postcard => Self::postcard(),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Codec::Json(_) => TAG_JSON,
            Codec::Postcard(_) => TAG_POSTCARD,
        }
    }

    /// Reads the format tag of an encoded envelope.
    pub fn detect(data: &[u8]) -> Result<Self, TransportError> {
        match data.first() {
            Some(&TAG_JSON) => Ok(Self::json()),
            Some(&TAG_POSTCARD) => Ok(Self::postcard()),
            Some(other) => Err(TransportError::Codec(format!("unknown format tag {}", other))),
            None => Err(TransportError::Codec("empty message".to_string())),
        }
    }

    pub fn encode_request(&self, request: &RpcRequest) -> Result<Vec<u8>, TransportError> {
        let body = match self {
            Codec::Json(_) => JsonCodec::encode(request)?,
            Codec::Postcard(_) => PostcardCodec::encode(request)?,
        };
        Ok(self.with_tag(body))
    }

    pub fn encode_response(&self, response: &RpcResponse) -> Result<Vec<u8>, TransportError> {
        let body = match self {
            Codec::Json(_) => JsonCodec::encode(response)?,
            Codec::Postcard(_) => PostcardCodec::encode(response)?,
        };
        Ok(self.with_tag(body))
    }

    /// Decodes a request using whichever codec its tag names.
    pub fn decode_request(data: &[u8]) -> Result<RpcRequest, TransportError> {
        match Self::detect(data)? {
            Codec::Json(_) => JsonCodec::decode(&data[1..]),
            Codec::Postcard(_) => PostcardCodec::decode(&data[1..]),
        }
    }

    /// Decodes a response using whichever codec its tag names.
    pub fn decode_response(data: &[u8]) -> Result<RpcResponse, TransportError> {
        match Self::detect(data)? {
            Codec::Json(_) => JsonCodec::decode(&data[1..]),
            Codec::Postcard(_) => PostcardCodec::decode(&data[1..]),
        }
    }

    fn with_tag(&self, body: Vec<u8>) -> Vec<u8> {
        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(self.tag());
        out.extend_from_slice(&body);
        out
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::json()
    }
}

/// JSON body codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonCodec;

impl JsonCodec {
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
        serde_json::from_slice(data).map_err(|e| TransportError::Codec(e.to_string()))
    }
}

/// Postcard body codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostcardCodec;

impl PostcardCodec {
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, TransportError> {
        postcard::to_allocvec(value).map_err(|e| TransportError::Codec(e.to_string()))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
        postcard::from_bytes(data).map_err(|e| TransportError::Codec(e.to_string()))
    }
}
