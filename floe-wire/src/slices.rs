//! Layered class values with slice preservation.
//!
//! A class instance on the wire is an ordered list of (type id, bytes)
//! layers, most-derived first. Decoding walks the layers through an
//! [`Activator`]; layers the activator refuses are kept as opaque bytes and
//! re-emitted verbatim on encode, so an intermediate hop that only knows a
//! base type still forwards the full value losslessly.

use bytes::Bytes;
use floe_types::Error;

use crate::varint::{put_string, put_varuint62};
use crate::Decoder;

/// Depth guard default; individual decoders may pass a tighter bound.
pub const DEFAULT_MAX_SLICE_DEPTH: usize = 100;

/// One layer of a class value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSlice {
    pub type_id: String,
    pub data: Bytes,
}

impl ClassSlice {
    pub fn new(type_id: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            type_id: type_id.into(),
            data: data.into(),
        }
    }
}

/// A decoded class value.
///
/// `slices` starts at the most specific type the activator recognized;
/// `preserved` holds the more-derived layers it refused, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicedClass {
    pub preserved: Vec<ClassSlice>,
    pub slices: Vec<ClassSlice>,
}

impl SlicedClass {
    /// Build a value with no preserved layers, most-derived slice first.
    pub fn new(slices: Vec<ClassSlice>) -> Self {
        Self {
            preserved: Vec::new(),
            slices,
        }
    }

    /// The most specific decodable type id.
    pub fn type_id(&self) -> Option<&str> {
        self.slices.first().map(|s| s.type_id.as_str())
    }

    fn layers(&self) -> impl Iterator<Item = &ClassSlice> {
        self.preserved.iter().chain(self.slices.iter())
    }
}

/// Decides which type ids the local program can instantiate.
pub trait Activator {
    fn activates(&self, type_id: &str) -> bool;
}

impl<F> Activator for F
where
    F: Fn(&str) -> bool,
{
    fn activates(&self, type_id: &str) -> bool {
        self(type_id)
    }
}

/// Re-emit a class value, preserved layers included, in wire order.
pub fn encode_class(class: &SlicedClass, buf: &mut Vec<u8>) {
    put_varuint62(buf, class.layers().count() as u64);
    for slice in class.layers() {
        put_string(buf, &slice.type_id);
        put_varuint62(buf, slice.data.len() as u64);
        buf.extend_from_slice(&slice.data);
    }
}

/// Decode a class value, preserving layers the activator refuses.
///
/// Fails with [`Error::InvalidData`] when the layer count exceeds
/// `max_depth` or when no layer at all is decodable.
pub fn decode_class(
    bytes: &[u8],
    activator: &dyn Activator,
    max_depth: usize,
) -> Result<SlicedClass, Error> {
    let mut dec = Decoder::new(bytes);
    let count = dec.read_varuint62()? as usize;
    if count > max_depth {
        return Err(Error::InvalidData(format!(
            "class graph of depth {count} exceeds limit {max_depth}"
        )));
    }

    let mut layers = Vec::with_capacity(count);
    for _ in 0..count {
        let type_id = dec.read_string()?;
        let len = dec.read_varuint62()? as usize;
        let data = dec.read_bytes(len, "class slice")?;
        layers.push(ClassSlice { type_id, data });
    }

    let split = layers
        .iter()
        .position(|slice| activator.activates(&slice.type_id))
        .ok_or_else(|| Error::InvalidData("no decodable slice in class value".into()))?;
    let slices = layers.split_off(split);
    Ok(SlicedClass {
        preserved: layers,
        slices,
    })
}
