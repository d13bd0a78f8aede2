//! Legacy framed protocol codec.
//!
//! One byte stream, sequential frames. Every frame starts with a 14-byte
//! header: 4-byte magic, protocol and protocol-encoding versions, frame
//! type, compression status, and a `u32` LE size that includes the header
//! itself. Request/Reply bodies correlate through a signed 32-bit request
//! id; id 0 marks a oneway request that gets no reply.

use bytes::Bytes;
use floe_types::{Context, DispatchErrorCode, Encoding, Error};

use crate::varint::{put_ice_size, put_ice_string};
use crate::Decoder;

pub const MAGIC: [u8; 4] = *b"IceP";
pub const PROTOCOL_MAJOR: u8 = 1;
pub const PROTOCOL_MINOR: u8 = 0;
pub const PROTOCOL_ENCODING_MAJOR: u8 = 1;
pub const PROTOCOL_ENCODING_MINOR: u8 = 0;

/// Frame header length, included in the on-wire frame size.
pub const HEADER_LEN: usize = 14;

/// Encapsulation header length (i32 size + encoding), included in the
/// encapsulation size.
pub const ENCAPSULATION_HEADER_LEN: usize = 6;

/// Request id of oneway requests; never registered for a reply.
pub const ONEWAY_REQUEST_ID: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IceFrameType {
    Request = 0,
    /// Declared by the protocol; decoded and skipped on receive, never sent.
    RequestBatch = 1,
    Reply = 2,
    ValidateConnection = 3,
    CloseConnection = 4,
}

impl IceFrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Request),
            1 => Some(Self::RequestBatch),
            2 => Some(Self::Reply),
            3 => Some(Self::ValidateConnection),
            4 => Some(Self::CloseConnection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IceFrameHeader {
    pub frame_type: IceFrameType,
    pub compression: u8,
    /// Total frame size, header included.
    pub frame_size: u32,
}

pub fn encode_frame_header(header: &IceFrameHeader, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(&[
        PROTOCOL_MAJOR,
        PROTOCOL_MINOR,
        PROTOCOL_ENCODING_MAJOR,
        PROTOCOL_ENCODING_MINOR,
        header.frame_type as u8,
        header.compression,
    ]);
    buf.extend_from_slice(&header.frame_size.to_le_bytes());
}

pub fn decode_frame_header(bytes: &[u8]) -> Result<IceFrameHeader, Error> {
    let mut dec = Decoder::new(bytes);
    let magic = dec.read_slice(4, "magic")?;
    if magic != MAGIC {
        return Err(Error::Protocol(format!("bad magic {magic:02x?}")));
    }
    let protocol = dec.read_slice(2, "protocol version")?;
    if protocol != [PROTOCOL_MAJOR, PROTOCOL_MINOR] {
        return Err(Error::Protocol(format!(
            "unsupported protocol version {}.{}",
            protocol[0], protocol[1]
        )));
    }
    let encoding = dec.read_slice(2, "protocol encoding")?;
    if encoding != [PROTOCOL_ENCODING_MAJOR, PROTOCOL_ENCODING_MINOR] {
        return Err(Error::Protocol(format!(
            "unsupported protocol encoding {}.{}",
            encoding[0], encoding[1]
        )));
    }
    let frame_type = dec.read_u8()?;
    let frame_type = IceFrameType::from_u8(frame_type)
        .ok_or_else(|| Error::Protocol(format!("unknown frame type {frame_type}")))?;
    let compression = dec.read_u8()?;
    let frame_size = dec.read_u32_le()?;
    if (frame_size as usize) < HEADER_LEN {
        return Err(Error::Protocol(format!("frame size {frame_size} too small")));
    }
    Ok(IceFrameHeader {
        frame_type,
        compression,
        frame_size,
    })
}

/// Build a complete frame from a body.
pub fn frame(frame_type: IceFrameType, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    encode_frame_header(
        &IceFrameHeader {
            frame_type,
            compression: 0,
            frame_size: (HEADER_LEN + body.len()) as u32,
        },
        &mut buf,
    );
    buf.extend_from_slice(body);
    buf
}

// ============================================================================
// Identity
// ============================================================================

/// Target identity carried in request frames, derived from the proxy path.
///
/// `/name` maps to an identity with an empty category; `/category/name` to
/// one with both. Deeper paths cannot be represented in the legacy protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub category: String,
}

impl Identity {
    pub fn from_path(path: &str) -> Result<Self, Error> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| Error::InvalidArgument(format!("path must be absolute: {path:?}")))?;
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            [name] if !name.is_empty() => Ok(Identity {
                name: percent_decode(name)?,
                category: String::new(),
            }),
            [category, name] if !name.is_empty() => Ok(Identity {
                name: percent_decode(name)?,
                category: percent_decode(category)?,
            }),
            _ => Err(Error::InvalidArgument(format!(
                "path {path:?} does not map to an identity"
            ))),
        }
    }

    pub fn to_path(&self) -> String {
        if self.category.is_empty() {
            format!("/{}", self.name)
        } else {
            format!("/{}/{}", self.category, self.name)
        }
    }
}

/// Decode `%XX` escapes in a path segment.
fn percent_decode(segment: &str) -> Result<String, Error> {
    let bytes = segment.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| {
                    Error::InvalidArgument(format!("invalid escape in segment {segment:?}"))
                })?;
            out.push(hex);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out)
        .map_err(|_| Error::InvalidArgument(format!("segment {segment:?} is not utf-8")))
}

// ============================================================================
// Bodies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperationMode {
    #[default]
    Normal = 0,
    Nonmutating = 1,
    Idempotent = 2,
}

impl OperationMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Normal),
            1 => Some(Self::Nonmutating),
            2 => Some(Self::Idempotent),
            _ => None,
        }
    }
}

/// A payload wrapped with its size and encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encapsulation {
    pub encoding: Encoding,
    pub payload: Bytes,
}

impl Encapsulation {
    pub fn new(encoding: Encoding, payload: Bytes) -> Self {
        Self { encoding, payload }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let size = (ENCAPSULATION_HEADER_LEN + self.payload.len()) as i32;
        buf.extend_from_slice(&size.to_le_bytes());
        buf.push(self.encoding.major);
        buf.push(self.encoding.minor);
        buf.extend_from_slice(&self.payload);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, Error> {
        let size = dec.read_i32_le()?;
        let size = usize::try_from(size)
            .ok()
            .filter(|s| *s >= ENCAPSULATION_HEADER_LEN)
            .ok_or_else(|| Error::Protocol(format!("invalid encapsulation size {size}")))?;
        let major = dec.read_u8()?;
        let minor = dec.read_u8()?;
        let payload = dec.read_bytes(size - ENCAPSULATION_HEADER_LEN, "encapsulation")?;
        Ok(Self {
            encoding: Encoding { major, minor },
            payload,
        })
    }
}

/// Body of a Request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceRequest {
    pub request_id: i32,
    pub identity: Identity,
    pub facet: Vec<String>,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    pub encapsulation: Encapsulation,
}

impl IceRequest {
    pub fn is_oneway(&self) -> bool {
        self.request_id == ONEWAY_REQUEST_ID
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        put_ice_string(buf, &self.identity.name);
        put_ice_string(buf, &self.identity.category);
        put_ice_size(buf, self.facet.len());
        for facet in &self.facet {
            put_ice_string(buf, facet);
        }
        put_ice_string(buf, &self.operation);
        buf.push(self.mode as u8);
        put_ice_size(buf, self.context.0.len());
        for (key, value) in &self.context.0 {
            put_ice_string(buf, key);
            put_ice_string(buf, value);
        }
        self.encapsulation.encode(buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, Error> {
        let request_id = dec.read_i32_le()?;
        let name = dec.read_ice_string()?;
        let category = dec.read_ice_string()?;
        let facet_count = dec.read_ice_size()?;
        if facet_count > 1 {
            // The facet path holds at most one element on the wire.
            return Err(Error::Protocol(format!("facet path of {facet_count} elements")));
        }
        let mut facet = Vec::with_capacity(facet_count);
        for _ in 0..facet_count {
            facet.push(dec.read_ice_string()?);
        }
        let operation = dec.read_ice_string()?;
        let mode = dec.read_u8()?;
        let mode = OperationMode::from_u8(mode)
            .ok_or_else(|| Error::Protocol(format!("unknown operation mode {mode}")))?;
        let context_count = dec.read_ice_size()?;
        let mut context = Context::new();
        for _ in 0..context_count {
            let key = dec.read_ice_string()?;
            let value = dec.read_ice_string()?;
            context.0.insert(key, value);
        }
        let encapsulation = Encapsulation::decode(dec)?;
        Ok(Self {
            request_id,
            identity: Identity { name, category },
            facet,
            operation,
            mode,
            context,
            encapsulation,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    UserException = 1,
    ObjectNotExist = 2,
    FacetNotExist = 3,
    OperationNotExist = 4,
    UnknownLocalException = 5,
    UnknownUserException = 6,
    UnknownException = 7,
}

impl ReplyStatus {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::UserException),
            2 => Some(Self::ObjectNotExist),
            3 => Some(Self::FacetNotExist),
            4 => Some(Self::OperationNotExist),
            5 => Some(Self::UnknownLocalException),
            6 => Some(Self::UnknownUserException),
            7 => Some(Self::UnknownException),
            _ => None,
        }
    }

    /// System status for a local dispatch failure.
    pub fn for_dispatch_code(code: DispatchErrorCode) -> Self {
        match code {
            DispatchErrorCode::ServiceNotFound => Self::ObjectNotExist,
            DispatchErrorCode::OperationNotFound => Self::OperationNotExist,
            DispatchErrorCode::InvalidData => Self::UnknownLocalException,
            DispatchErrorCode::UnhandledException | DispatchErrorCode::Cancelled => {
                Self::UnknownException
            }
        }
    }

    /// The dispatch code a system status maps back to; `None` for statuses
    /// that carry a regular result or user exception payload.
    pub fn dispatch_code(self) -> Option<DispatchErrorCode> {
        match self {
            Self::Ok | Self::UserException => None,
            Self::ObjectNotExist | Self::FacetNotExist => Some(DispatchErrorCode::ServiceNotFound),
            Self::OperationNotExist => Some(DispatchErrorCode::OperationNotFound),
            Self::UnknownLocalException => Some(DispatchErrorCode::InvalidData),
            Self::UnknownUserException | Self::UnknownException => {
                Some(DispatchErrorCode::UnhandledException)
            }
        }
    }
}

/// Body of a Reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceReply {
    pub request_id: i32,
    pub status: ReplyStatus,
    pub encapsulation: Encapsulation,
}

impl IceReply {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.push(self.status as u8);
        self.encapsulation.encode(buf);
    }

    pub fn decode(dec: &mut Decoder<'_>) -> Result<Self, Error> {
        let request_id = dec.read_i32_le()?;
        let status = dec.read_u8()?;
        let status = ReplyStatus::from_u8(status)
            .ok_or_else(|| Error::Protocol(format!("unknown reply status {status}")))?;
        let encapsulation = Encapsulation::decode(dec)?;
        Ok(Self {
            request_id,
            status,
            encapsulation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_roundtrip() {
        let header = IceFrameHeader {
            frame_type: IceFrameType::Reply,
            compression: 0,
            frame_size: 240,
        };
        let mut buf = Vec::new();
        encode_frame_header(&header, &mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(decode_frame_header(&buf).unwrap(), header);
    }

    #[test]
    fn frame_header_rejects_bad_magic_and_version() {
        let mut buf = Vec::new();
        encode_frame_header(
            &IceFrameHeader {
                frame_type: IceFrameType::ValidateConnection,
                compression: 0,
                frame_size: 14,
            },
            &mut buf,
        );

        let mut bad_magic = buf.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            decode_frame_header(&bad_magic),
            Err(Error::Protocol(_))
        ));

        let mut bad_version = buf.clone();
        bad_version[4] = 9;
        assert!(matches!(
            decode_frame_header(&bad_version),
            Err(Error::Protocol(_))
        ));

        let mut bad_size = buf;
        bad_size[10..14].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(
            decode_frame_header(&bad_size),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn request_body_roundtrip() {
        let request = IceRequest {
            request_id: 7,
            identity: Identity {
                name: "counter".into(),
                category: "stats".into(),
            },
            facet: vec![],
            operation: "increment".into(),
            mode: OperationMode::Idempotent,
            context: Context::new().with("trace", "t-42"),
            encapsulation: Encapsulation::new(Encoding::V1_1, Bytes::from_static(b"\x05\x00")),
        };
        let mut buf = Vec::new();
        request.encode(&mut buf);
        let mut dec = Decoder::new(&buf);
        assert_eq!(IceRequest::decode(&mut dec).unwrap(), request);
        assert!(dec.is_empty());
    }

    #[test]
    fn reply_body_roundtrip() {
        let reply = IceReply {
            request_id: 7,
            status: ReplyStatus::ObjectNotExist,
            encapsulation: Encapsulation::new(Encoding::V1_1, Bytes::from_static(b"gone")),
        };
        let mut buf = Vec::new();
        reply.encode(&mut buf);
        let mut dec = Decoder::new(&buf);
        assert_eq!(IceReply::decode(&mut dec).unwrap(), reply);
    }

    #[test]
    fn identity_maps_paths_both_ways() {
        assert_eq!(
            Identity::from_path("/hello").unwrap(),
            Identity {
                name: "hello".into(),
                category: String::new(),
            }
        );
        let identity = Identity::from_path("/stats/counter").unwrap();
        assert_eq!(identity.category, "stats");
        assert_eq!(identity.to_path(), "/stats/counter");

        assert_eq!(
            Identity::from_path("/a%20b").unwrap().name,
            "a b".to_string()
        );

        assert!(Identity::from_path("/").is_err());
        assert!(Identity::from_path("/a/b/c").is_err());
        assert!(Identity::from_path("relative").is_err());
    }

    #[test]
    fn encapsulation_rejects_undersized() {
        // Size 3 is below the 6-byte encapsulation header.
        let mut buf = Vec::new();
        buf.extend_from_slice(&3i32.to_le_bytes());
        buf.extend_from_slice(&[1, 1]);
        let mut dec = Decoder::new(&buf);
        assert!(matches!(
            Encapsulation::decode(&mut dec),
            Err(Error::Protocol(_))
        ));
    }
}
