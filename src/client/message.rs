use super::error::ClientError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Protocol version stamped on every outbound message
pub const PROTOCOL_VERSION: &str = "1";

/// Upper bound on buffered bytes that do not yet form a complete message
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Wire envelope shared by requests and responses.
///
/// A request carries `method` (and usually `params`). A response has no method and is
/// correlated to its request by `id` alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "v", default)]
    pub version: String,
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

impl Message {
    pub fn request(id: u64, source: &str, target: &str, method: &str, params: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id,
            target: target.to_string(),
            source: source.to_string(),
            method: Some(method.to_string()),
            params: Some(params),
            ..Default::default()
        }
    }

    pub fn response(id: u64, source: &str, target: &str, result: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            id,
            target: target.to_string(),
            source: source.to_string(),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    /// Value of a top-level string field in `params`
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.as_ref()?.get(key)?.as_str()
    }
}

/// Codec for a stream of JSON-encoded [`Message`] values.
///
/// Outbound messages are written one per line. Inbound values may be separated by any
/// JSON whitespace, or by none at all. The decoder remembers how far it has scanned a
/// partial value so bytes arriving in small reads are only looked at once.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_size: usize,
    scan: Scan,
}

/// Progress through the value at the head of the buffer
#[derive(Debug, Clone, Copy, Default)]
struct Scan {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::with_max_size(MAX_MESSAGE_SIZE)
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Codec that rejects incomplete values larger than `max_size` bytes
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            scan: Scan::default(),
        }
    }

    /// Offset one past the end of the object or array at the head of `src`, if complete
    fn find_end(&mut self, src: &[u8]) -> Option<usize> {
        let scan = &mut self.scan;

        for (at, &byte) in src.iter().enumerate().skip(scan.pos) {
            if scan.in_string {
                if scan.escaped {
                    scan.escaped = false;
                } else if byte == b'\\' {
                    scan.escaped = true;
                } else if byte == b'"' {
                    scan.in_string = false;
                }
                continue;
            }

            match byte {
                b'"' => scan.in_string = true,
                b'{' | b'[' => scan.depth += 1,
                b'}' | b']' => {
                    scan.depth = scan.depth.saturating_sub(1);
                    if scan.depth == 0 {
                        *scan = Scan::default();
                        return Some(at + 1);
                    }
                }
                _ => {}
            }
        }

        scan.pos = src.len();
        None
    }

    /// Values that are not objects or arrays can never be a message; let serde_json
    /// describe what is wrong with them.
    fn decode_scalar(&self, src: &mut BytesMut) -> Result<Option<Message>, ClientError> {
        let next = serde_json::Deserializer::from_slice(&src[..]).into_iter::<Message>().next();

        match next {
            Some(Err(err)) if err.is_eof() => self.check_size(src).map(|()| None),
            Some(Err(err)) => Err(err.into()),
            Some(Ok(_)) | None => Err(ClientError::UnexpectedEof),
        }
    }

    fn check_size(&self, src: &BytesMut) -> Result<(), ClientError> {
        if src.len() > self.max_size {
            return Err(ClientError::MessageTooLarge { limit: self.max_size });
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ClientError> {
        if self.scan.pos == 0 {
            let whitespace = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
            src.advance(whitespace);

            match src.first().copied() {
                None => return Ok(None),
                Some(b'{') | Some(b'[') => {}
                Some(_) => return self.decode_scalar(src),
            }
        }

        match self.find_end(&src[..]) {
            Some(end) => {
                let message = serde_json::from_slice(&src[..end])?;
                src.advance(end);
                Ok(Some(message))
            }
            None => {
                self.check_size(src)?;
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, ClientError> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => Err(ClientError::UnexpectedEof),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ClientError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), ClientError> {
        serde_json::to_writer((&mut *dst).writer(), &item)?;
        dst.put_u8(b'\n');
        Ok(())
    }
}
