#![deny(unsafe_code)]

//! Wire codecs for the floe RPC runtime.
//!
//! Pure byte-level encode/decode, no I/O: the legacy framed protocol
//! ([`ice`]), the multiplexed protocol and its slic-style transport framing
//! ([`icerpc`]), integer-keyed field maps ([`fields`]), and layered class
//! values with slice preservation ([`slices`]). Connections in the `floe`
//! crate drive these against their transports.

mod decode;
pub mod fields;
pub mod ice;
pub mod icerpc;
pub mod slices;
pub mod varint;

pub use decode::Decoder;
