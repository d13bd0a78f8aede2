//! Integer-keyed field maps.
//!
//! Fields are the header side-channel of both protocols: `dict<int32, bytes>`
//! encoded as a varuint62 count followed by key/length/bytes entries.
//! Outgoing maps may carry encoder callbacks; a callback failure aborts the
//! whole encode with [`Error::InvalidArgument`] before anything is sent.
//! Unknown keys pass through decoding untouched.

use bytes::Bytes;
use floe_types::{Context, Error, IncomingFields, OutgoingFieldValue, OutgoingFields};

use crate::varint::{put_string, put_varuint62, varuint62_bytes};
use crate::Decoder;

pub fn encode_fields(fields: &OutgoingFields, buf: &mut Vec<u8>) -> Result<(), Error> {
    put_varuint62(buf, fields.len() as u64);
    let mut value_buf = Vec::new();
    for (key, value) in fields {
        if *key < 0 {
            return Err(Error::InvalidArgument(format!("negative field key {key}")));
        }
        value_buf.clear();
        value.encode(&mut value_buf)?;
        put_varuint62(buf, *key as u64);
        put_varuint62(buf, value_buf.len() as u64);
        buf.extend_from_slice(&value_buf);
    }
    Ok(())
}

pub fn decode_fields(dec: &mut Decoder<'_>) -> Result<IncomingFields, Error> {
    let count = dec.read_varuint62()?;
    let mut fields = IncomingFields::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let key = i32::try_from(dec.read_varuint62()?)
            .map_err(|_| Error::Protocol("field key out of range".into()))?;
        let len = dec.read_varuint62()? as usize;
        let value = dec.read_bytes(len, "field value")?;
        fields.insert(key, value);
    }
    Ok(fields)
}

/// Field value holding one varuint62-encoded integer.
pub fn varuint_field(value: u64) -> OutgoingFieldValue {
    OutgoingFieldValue::Bytes(Bytes::from(varuint62_bytes(value)))
}

/// Decode a field value written by [`varuint_field`].
pub fn decode_varuint_field(bytes: &Bytes) -> Result<u64, Error> {
    let mut dec = Decoder::new(bytes);
    let value = dec.read_varuint62()?;
    if !dec.is_empty() {
        return Err(Error::Protocol("trailing bytes in integer field".into()));
    }
    Ok(value)
}

/// Field value carrying request context entries as `dict<string, string>`.
pub fn context_field(context: &Context) -> OutgoingFieldValue {
    let mut buf = Vec::new();
    put_varuint62(&mut buf, context.0.len() as u64);
    for (key, value) in &context.0 {
        put_string(&mut buf, key);
        put_string(&mut buf, value);
    }
    OutgoingFieldValue::Bytes(Bytes::from(buf))
}

/// Decode a field value written by [`context_field`].
pub fn decode_context_field(bytes: &Bytes) -> Result<Context, Error> {
    let mut dec = Decoder::new(bytes);
    let count = dec.read_varuint62()?;
    let mut context = Context::new();
    for _ in 0..count {
        let key = dec.read_string()?;
        let value = dec.read_string()?;
        context.0.insert(key, value);
    }
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_types::connection_fields::MAX_HEADER_SIZE;

    #[test]
    fn fields_roundtrip_with_unknown_keys() {
        let mut fields = OutgoingFields::new();
        fields.insert(MAX_HEADER_SIZE, varuint_field(56));
        fields.insert(10, varuint_field(38));
        fields.insert(977, OutgoingFieldValue::Bytes(Bytes::from_static(b"\x01\x02")));

        let mut buf = Vec::new();
        encode_fields(&fields, &mut buf).unwrap();

        let mut dec = Decoder::new(&buf);
        let decoded = decode_fields(&mut dec).unwrap();
        assert!(dec.is_empty());
        assert_eq!(decoded.len(), 3);
        assert_eq!(decode_varuint_field(&decoded[&MAX_HEADER_SIZE]).unwrap(), 56);
        assert_eq!(decode_varuint_field(&decoded[&10]).unwrap(), 38);
        assert_eq!(decoded[&977].as_ref(), b"\x01\x02");
    }

    #[test]
    fn encoder_failure_aborts_encode() {
        let mut fields = OutgoingFields::new();
        fields.insert(
            3,
            OutgoingFieldValue::Encoder(Box::new(|_| {
                Err(Error::InvalidArgument("invalid request fields".into()))
            })),
        );
        let mut buf = Vec::new();
        assert!(matches!(
            encode_fields(&fields, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn negative_key_is_rejected() {
        let mut fields = OutgoingFields::new();
        fields.insert(-1, OutgoingFieldValue::Bytes(Bytes::new()));
        let mut buf = Vec::new();
        assert!(encode_fields(&fields, &mut buf).is_err());
    }

    #[test]
    fn context_field_roundtrips() {
        let context = Context::new().with("trace", "abc").with("user", "u7");
        let encoded = match context_field(&context) {
            OutgoingFieldValue::Bytes(b) => b,
            _ => unreachable!(),
        };
        assert_eq!(decode_context_field(&encoded).unwrap(), context);
    }
}
