//! Request and response envelopes.
//!
//! An outgoing frame is owned by its producer until the connection takes it;
//! from the moment `invoke`/`dispatch` begins, the connection owns every
//! payload in the frame and must complete each exactly once with the
//! definitive outcome. Incoming frames hand their payloads to the consumer
//! under the same contract.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::{Error, Features, PayloadSinkDecorator, PayloadSource, Proxy, RetryHint};

/// Whether a response carries a result or a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultType {
    Success = 0,
    Failure = 1,
}

impl ResultType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Payload encoding tag, `major.minor` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    pub major: u8,
    pub minor: u8,
}

impl Encoding {
    /// Encoding of legacy framed-protocol payloads.
    pub const V1_1: Encoding = Encoding { major: 1, minor: 1 };
    /// Encoding of multiplexed-protocol payloads.
    pub const V2_0: Encoding = Encoding { major: 2, minor: 0 };
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Absolute instant after which the peer should give up on a request.
///
/// `NEVER` is the sentinel for "no deadline"; it encodes as `-1`
/// milliseconds-since-epoch on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<SystemTime>);

impl Deadline {
    pub const NEVER: Deadline = Deadline(None);

    pub fn at(when: SystemTime) -> Self {
        Deadline(Some(when))
    }

    pub fn after(duration: Duration) -> Self {
        Deadline(Some(SystemTime::now() + duration))
    }

    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    pub fn time(&self) -> Option<SystemTime> {
        self.0
    }

    /// Milliseconds since the unix epoch, `-1` for never.
    pub fn to_unix_millis(&self) -> i64 {
        match self.0 {
            None => -1,
            Some(when) => when
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    pub fn from_unix_millis(millis: i64) -> Self {
        if millis < 0 {
            Deadline::NEVER
        } else {
            Deadline(Some(UNIX_EPOCH + Duration::from_millis(millis as u64)))
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::NEVER
    }
}

// ============================================================================
// Fields
// ============================================================================

/// Fallible encoder callback for an outgoing field value.
pub type FieldEncoder = Box<dyn Fn(&mut Vec<u8>) -> Result<(), Error> + Send + Sync>;

/// Value of an outgoing header field: raw bytes, or an encoder run at send
/// time. An encoder failure fails the operation with
/// [`Error::InvalidArgument`] before anything reaches the wire.
pub enum OutgoingFieldValue {
    Bytes(Bytes),
    Encoder(FieldEncoder),
}

impl OutgoingFieldValue {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), Error> {
        match self {
            OutgoingFieldValue::Bytes(bytes) => {
                buf.extend_from_slice(bytes);
                Ok(())
            }
            OutgoingFieldValue::Encoder(encoder) => encoder(buf),
        }
    }
}

impl From<Bytes> for OutgoingFieldValue {
    fn from(bytes: Bytes) -> Self {
        OutgoingFieldValue::Bytes(bytes)
    }
}

impl fmt::Debug for OutgoingFieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutgoingFieldValue::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            OutgoingFieldValue::Encoder(_) => f.write_str("Encoder"),
        }
    }
}

/// Integer-keyed header side-channel, ordered for deterministic encoding.
pub type OutgoingFields = BTreeMap<i32, OutgoingFieldValue>;

/// Decoded header side-channel: key to raw value bytes.
pub type IncomingFields = HashMap<i32, Bytes>;

/// Keys recognized in request field maps. Unknown keys are forwarded when
/// the sender opts in, otherwise dropped.
pub mod request_fields {
    pub const CONTEXT: i32 = 0;
    pub const IDEMPOTENT: i32 = 1;
    pub const COMPRESSION_FORMAT: i32 = 2;
}

/// Keys recognized in connection-establishment field maps.
pub mod connection_fields {
    pub const MAX_HEADER_SIZE: i32 = 0;
}

// ============================================================================
// Frames
// ============================================================================

/// A request owned by the caller until `invoke` takes it.
pub struct OutgoingRequest {
    pub proxy: Proxy,
    /// Operation name; never empty.
    pub operation: String,
    pub idempotent: bool,
    pub oneway: bool,
    pub deadline: Deadline,
    pub payload: PayloadSource,
    pub payload_stream: Option<PayloadSource>,
    pub fields: OutgoingFields,
    pub features: Features,
    /// Decorators wrapped around the wire sink before the payload is copied
    /// into it; last pushed outermost.
    pub payload_writers: Vec<PayloadSinkDecorator>,
    /// Written by the connection on failure; read by a retry interceptor.
    pub retry_hint: RetryHint,
}

impl OutgoingRequest {
    pub fn new(proxy: Proxy, operation: impl Into<String>) -> Self {
        Self {
            proxy,
            operation: operation.into(),
            idempotent: false,
            oneway: false,
            deadline: Deadline::NEVER,
            payload: PayloadSource::empty(),
            payload_stream: None,
            fields: OutgoingFields::new(),
            features: Features::new(),
            payload_writers: Vec::new(),
            retry_hint: RetryHint::new(),
        }
    }

    /// The target path; always equal to the proxy's path.
    pub fn path(&self) -> &str {
        self.proxy.path()
    }

    pub fn with_payload(mut self, payload: PayloadSource) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_oneway(mut self, oneway: bool) -> Self {
        self.oneway = oneway;
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }
}

impl fmt::Debug for OutgoingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingRequest")
            .field("path", &self.path())
            .field("operation", &self.operation)
            .field("oneway", &self.oneway)
            .field("idempotent", &self.idempotent)
            .finish_non_exhaustive()
    }
}

/// A request decoded from the wire, handed to a dispatcher.
pub struct IncomingRequest {
    pub path: String,
    pub operation: String,
    pub idempotent: bool,
    pub oneway: bool,
    pub deadline: Deadline,
    pub fields: IncomingFields,
    pub features: Features,
    pub payload: PayloadSource,
    pub payload_stream: Option<PayloadSource>,
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("path", &self.path)
            .field("operation", &self.operation)
            .field("oneway", &self.oneway)
            .finish_non_exhaustive()
    }
}

/// A response produced by a dispatcher.
pub struct OutgoingResponse {
    pub result_type: ResultType,
    pub fields: OutgoingFields,
    pub payload: PayloadSource,
    pub payload_stream: Option<PayloadSource>,
}

impl OutgoingResponse {
    pub fn success(payload: PayloadSource) -> Self {
        Self {
            result_type: ResultType::Success,
            fields: OutgoingFields::new(),
            payload,
            payload_stream: None,
        }
    }

    pub fn failure(payload: PayloadSource) -> Self {
        Self {
            result_type: ResultType::Failure,
            fields: OutgoingFields::new(),
            payload,
            payload_stream: None,
        }
    }
}

impl fmt::Debug for OutgoingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutgoingResponse")
            .field("result_type", &self.result_type)
            .finish_non_exhaustive()
    }
}

/// A response decoded from the wire, owned by the caller of `invoke`.
///
/// The caller must complete the payload (with success or a cause); the
/// connection observes the completion and tears the stream down if the
/// caller drops the payload without completing it.
pub struct IncomingResponse {
    pub result_type: ResultType,
    pub encoding: Encoding,
    pub fields: IncomingFields,
    pub payload: PayloadSource,
    pub payload_stream: Option<PayloadSource>,
}

impl fmt::Debug for IncomingResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingResponse")
            .field("result_type", &self.result_type)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}
