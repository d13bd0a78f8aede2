//! Multiplexed protocol codec.
//!
//! Two layers live here. The slic-style transport framing (frame type,
//! varuint32 size, optional varuint62 stream id) is the wire interface a
//! byte-stream multiplexer implements; the runtime itself consumes
//! multiplexed streams through a trait and only uses the per-stream and
//! control codecs below.
//!
//! Stream layout for a request: varuint62-prefixed header, varuint62-prefixed
//! main payload segment, then raw payload-stream bytes until end-of-stream.
//! A response mirrors it with the payload size carried in the header.

use bytes::Bytes;
use floe_types::{
    Deadline, DispatchErrorCode, DispatchException, Encoding, Error, IncomingFields,
    OutgoingFields, ResultType,
};

use crate::fields::{decode_fields, encode_fields};
use crate::varint::{put_string, put_varuint32, put_varuint62};
use crate::Decoder;

// ============================================================================
// Slic framing
// ============================================================================

/// Space to reserve in front of a frame body: 1 type byte, up to 4 size
/// bytes, up to 8 stream-id bytes.
pub const MAX_HEADER_RESERVE: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlicFrameType {
    Initialize = 0x01,
    InitializeAck = 0x02,
    Close = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    Stream = 0x08,
    StreamLast = 0x09,
    StreamReset = 0x0A,
}

impl SlicFrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Initialize),
            0x02 => Some(Self::InitializeAck),
            0x04 => Some(Self::Close),
            0x05 => Some(Self::Ping),
            0x06 => Some(Self::Pong),
            0x08 => Some(Self::Stream),
            0x09 => Some(Self::StreamLast),
            0x0A => Some(Self::StreamReset),
            _ => None,
        }
    }

    /// Stream frames carry a stream id after the size; connection frames
    /// do not.
    pub fn has_stream_id(self) -> bool {
        matches!(self, Self::Stream | Self::StreamLast | Self::StreamReset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlicFrameHeader {
    pub frame_type: SlicFrameType,
    /// Body size, header excluded.
    pub frame_size: u32,
    pub stream_id: Option<u64>,
}

pub fn encode_slic_header(header: &SlicFrameHeader, buf: &mut Vec<u8>) -> Result<(), Error> {
    buf.push(header.frame_type as u8);
    put_varuint32(buf, header.frame_size)?;
    match (header.frame_type.has_stream_id(), header.stream_id) {
        (true, Some(id)) => put_varuint62(buf, id),
        (false, None) => {}
        (true, None) => {
            return Err(Error::InvalidArgument(
                "stream frame without stream id".into(),
            ));
        }
        (false, Some(_)) => {
            return Err(Error::InvalidArgument(
                "connection frame with stream id".into(),
            ));
        }
    }
    Ok(())
}

pub fn decode_slic_header(dec: &mut Decoder<'_>) -> Result<SlicFrameHeader, Error> {
    let frame_type = dec.read_u8()?;
    let frame_type = SlicFrameType::from_u8(frame_type)
        .ok_or_else(|| Error::Protocol(format!("unknown slic frame type {frame_type:#04x}")))?;
    let frame_size = dec.read_varuint32()?;
    let stream_id = if frame_type.has_stream_id() {
        Some(dec.read_varuint62()?)
    } else {
        None
    };
    Ok(SlicFrameHeader {
        frame_type,
        frame_size,
        stream_id,
    })
}

// ============================================================================
// Connection control frames
// ============================================================================

/// Frames exchanged on the connection control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlFrameType {
    /// First frame in each direction; carries the sender's fields map.
    Initialize = 0,
    /// Graceful shutdown announcement.
    GoAway = 1,
}

impl ControlFrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Initialize),
            1 => Some(Self::GoAway),
            _ => None,
        }
    }
}

/// Encode an Initialize control frame from the local fields map.
pub fn encode_initialize(fields: &OutgoingFields) -> Result<Vec<u8>, Error> {
    let mut buf = vec![ControlFrameType::Initialize as u8];
    encode_fields(fields, &mut buf)?;
    Ok(buf)
}

/// Encode a GoAway control frame.
pub fn encode_go_away(message: &str) -> Vec<u8> {
    let mut buf = vec![ControlFrameType::GoAway as u8];
    put_string(&mut buf, message);
    buf
}

/// A decoded control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Initialize(IncomingFields),
    GoAway(String),
}

pub fn decode_control_frame(bytes: &[u8]) -> Result<ControlFrame, Error> {
    let mut dec = Decoder::new(bytes);
    let frame_type = dec.read_u8()?;
    let frame_type = ControlFrameType::from_u8(frame_type)
        .ok_or_else(|| Error::Protocol(format!("unknown control frame type {frame_type}")))?;
    match frame_type {
        ControlFrameType::Initialize => Ok(ControlFrame::Initialize(decode_fields(&mut dec)?)),
        ControlFrameType::GoAway => Ok(ControlFrame::GoAway(dec.read_string()?)),
    }
}

// ============================================================================
// Stream request/response headers
// ============================================================================

const FLAG_IDEMPOTENT: u8 = 1 << 0;
const FLAG_HAS_PRIORITY: u8 = 1 << 1;

/// Header opening a request stream.
#[derive(Debug)]
pub struct RequestHeader {
    pub path: String,
    pub operation: String,
    pub idempotent: bool,
    /// Reserved; carried when present, otherwise omitted from the wire.
    pub priority: Option<u8>,
    pub deadline: Deadline,
    pub fields: OutgoingFields,
}

impl RequestHeader {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = Vec::new();
        put_string(&mut buf, &self.path);
        put_string(&mut buf, &self.operation);
        let mut flags = 0u8;
        if self.idempotent {
            flags |= FLAG_IDEMPOTENT;
        }
        if self.priority.is_some() {
            flags |= FLAG_HAS_PRIORITY;
        }
        buf.push(flags);
        if let Some(priority) = self.priority {
            buf.push(priority);
        }
        buf.extend_from_slice(&self.deadline.to_unix_millis().to_le_bytes());
        encode_fields(&self.fields, &mut buf)?;
        Ok(buf)
    }
}

/// Decoded form of [`RequestHeader`]; field values arrive as raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequestHeader {
    pub path: String,
    pub operation: String,
    pub idempotent: bool,
    pub priority: Option<u8>,
    pub deadline: Deadline,
    pub fields: IncomingFields,
}

pub fn decode_request_header(bytes: &[u8]) -> Result<IncomingRequestHeader, Error> {
    let mut dec = Decoder::new(bytes);
    let path = dec.read_string()?;
    let operation = dec.read_string()?;
    if operation.is_empty() {
        return Err(Error::Protocol("empty operation name".into()));
    }
    let flags = dec.read_u8()?;
    let priority = if flags & FLAG_HAS_PRIORITY != 0 {
        Some(dec.read_u8()?)
    } else {
        None
    };
    let deadline = Deadline::from_unix_millis(dec.read_i64_le()?);
    let fields = decode_fields(&mut dec)?;
    Ok(IncomingRequestHeader {
        path,
        operation,
        idempotent: flags & FLAG_IDEMPOTENT != 0,
        priority,
        deadline,
        fields,
    })
}

/// Header opening the response half of a stream.
#[derive(Debug)]
pub struct ResponseHeader {
    pub result_type: ResultType,
    pub encoding: Encoding,
    pub fields: OutgoingFields,
    /// Size of the main payload segment that follows the header.
    pub payload_size: u64,
}

impl ResponseHeader {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let mut buf = vec![
            self.result_type as u8,
            self.encoding.major,
            self.encoding.minor,
        ];
        encode_fields(&self.fields, &mut buf)?;
        put_varuint62(&mut buf, self.payload_size);
        Ok(buf)
    }
}

/// Decoded form of [`ResponseHeader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingResponseHeader {
    pub result_type: ResultType,
    pub encoding: Encoding,
    pub fields: IncomingFields,
    pub payload_size: u64,
}

pub fn decode_response_header(bytes: &[u8]) -> Result<IncomingResponseHeader, Error> {
    let mut dec = Decoder::new(bytes);
    let result_type = dec.read_u8()?;
    let result_type = ResultType::from_u8(result_type)
        .ok_or_else(|| Error::Protocol(format!("unknown result type {result_type}")))?;
    let major = dec.read_u8()?;
    let minor = dec.read_u8()?;
    let fields = decode_fields(&mut dec)?;
    let payload_size = dec.read_varuint62()?;
    Ok(IncomingResponseHeader {
        result_type,
        encoding: Encoding { major, minor },
        fields,
        payload_size,
    })
}

// ============================================================================
// Dispatch exception payloads
// ============================================================================

/// Payload of a failure response: error code byte + message.
pub fn encode_dispatch_exception(exception: &DispatchException) -> Bytes {
    let mut buf = vec![exception.code.as_u8()];
    put_string(&mut buf, &exception.message);
    Bytes::from(buf)
}

pub fn decode_dispatch_exception(bytes: &[u8]) -> Result<DispatchException, Error> {
    let mut dec = Decoder::new(bytes);
    let code = dec.read_u8()?;
    let code = DispatchErrorCode::from_u8(code)
        .ok_or_else(|| Error::Protocol(format!("unknown dispatch error code {code}")))?;
    let message = dec.read_string()?;
    Ok(DispatchException::new(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::varuint_field;
    use floe_types::request_fields;

    #[test]
    fn slic_header_roundtrip_with_and_without_stream_id() {
        let header = SlicFrameHeader {
            frame_type: SlicFrameType::StreamLast,
            frame_size: 9000,
            stream_id: Some(17),
        };
        let mut buf = Vec::new();
        encode_slic_header(&header, &mut buf).unwrap();
        assert!(buf.len() <= MAX_HEADER_RESERVE);
        let mut dec = Decoder::new(&buf);
        assert_eq!(decode_slic_header(&mut dec).unwrap(), header);

        let header = SlicFrameHeader {
            frame_type: SlicFrameType::Ping,
            frame_size: 0,
            stream_id: None,
        };
        buf.clear();
        encode_slic_header(&header, &mut buf).unwrap();
        let mut dec = Decoder::new(&buf);
        assert_eq!(decode_slic_header(&mut dec).unwrap(), header);
    }

    #[test]
    fn slic_header_stream_id_presence_is_enforced() {
        let mut buf = Vec::new();
        assert!(
            encode_slic_header(
                &SlicFrameHeader {
                    frame_type: SlicFrameType::Stream,
                    frame_size: 1,
                    stream_id: None,
                },
                &mut buf,
            )
            .is_err()
        );
        assert!(
            encode_slic_header(
                &SlicFrameHeader {
                    frame_type: SlicFrameType::Close,
                    frame_size: 1,
                    stream_id: Some(3),
                },
                &mut buf,
            )
            .is_err()
        );
    }

    #[test]
    fn initialize_roundtrip() {
        let mut fields = OutgoingFields::new();
        fields.insert(0, varuint_field(56));
        let frame = encode_initialize(&fields).unwrap();
        match decode_control_frame(&frame).unwrap() {
            ControlFrame::Initialize(decoded) => {
                assert_eq!(decoded.len(), 1);
                assert_eq!(
                    crate::fields::decode_varuint_field(&decoded[&0]).unwrap(),
                    56
                );
            }
            other => panic!("unexpected control frame {other:?}"),
        }
    }

    #[test]
    fn go_away_roundtrip() {
        let frame = encode_go_away("maintenance window");
        assert_eq!(
            decode_control_frame(&frame).unwrap(),
            ControlFrame::GoAway("maintenance window".into())
        );
    }

    #[test]
    fn request_header_roundtrip() {
        let mut fields = OutgoingFields::new();
        fields.insert(request_fields::COMPRESSION_FORMAT, varuint_field(1));
        let header = RequestHeader {
            path: "/stats/counter".into(),
            operation: "increment".into(),
            idempotent: true,
            priority: Some(4),
            deadline: Deadline::from_unix_millis(1_700_000_000_123),
            fields,
        };
        let encoded = header.encode().unwrap();
        let decoded = decode_request_header(&encoded).unwrap();
        assert_eq!(decoded.path, header.path);
        assert_eq!(decoded.operation, header.operation);
        assert!(decoded.idempotent);
        assert_eq!(decoded.priority, Some(4));
        assert_eq!(decoded.deadline, header.deadline);
        assert_eq!(decoded.fields.len(), 1);
    }

    #[test]
    fn request_header_never_deadline_and_no_priority() {
        let header = RequestHeader {
            path: "/x".into(),
            operation: "op".into(),
            idempotent: false,
            priority: None,
            deadline: Deadline::NEVER,
            fields: OutgoingFields::new(),
        };
        let decoded = decode_request_header(&header.encode().unwrap()).unwrap();
        assert!(decoded.deadline.is_never());
        assert_eq!(decoded.priority, None);
        assert!(!decoded.idempotent);
    }

    #[test]
    fn empty_operation_is_rejected() {
        let header = RequestHeader {
            path: "/x".into(),
            operation: String::new(),
            idempotent: false,
            priority: None,
            deadline: Deadline::NEVER,
            fields: OutgoingFields::new(),
        };
        assert!(matches!(
            decode_request_header(&header.encode().unwrap()),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn response_header_roundtrip() {
        let header = ResponseHeader {
            result_type: ResultType::Failure,
            encoding: Encoding::V2_0,
            fields: OutgoingFields::new(),
            payload_size: 77,
        };
        let decoded = decode_response_header(&header.encode().unwrap()).unwrap();
        assert_eq!(decoded.result_type, ResultType::Failure);
        assert_eq!(decoded.encoding, Encoding::V2_0);
        assert_eq!(decoded.payload_size, 77);
    }

    #[test]
    fn dispatch_exception_roundtrip() {
        let exception = DispatchException::new(DispatchErrorCode::InvalidData, "bad payload");
        let encoded = encode_dispatch_exception(&exception);
        assert_eq!(decode_dispatch_exception(&encoded).unwrap(), exception);
    }
}
