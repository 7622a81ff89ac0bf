//! The single serialization capability carried by all graph value types:
//! vertex ids, vertex values, edge values, and message values all encode to
//! and decode from raw bytes through `WireData`.

use std::fmt;
use std::hash::Hash;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::utils::GraphyneError;

/// Byte-level encode/decode capability. Implementations must be symmetric:
/// `decode` consumes exactly the bytes `encode` produced.
pub trait WireData: Clone + fmt::Debug + Send + Sync + 'static {
    /// Appends this value's encoding to the buffer.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes one value off the front of the buffer, advancing it.
    fn decode(buf: &mut Bytes) -> Result<Self, GraphyneError>
    where
        Self: Sized;

    /// Encodes into a standalone byte vector.
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Decodes from a standalone byte slice.
    fn from_bytes(bytes: &[u8]) -> Result<Self, GraphyneError>
    where
        Self: Sized,
    {
        let mut buf = Bytes::copy_from_slice(bytes);
        Self::decode(&mut buf)
    }
}

/// Marker trait for types usable as vertex ids: wire-codable, totally
/// ordered, and hashable.
pub trait VertexId: WireData + Ord + Hash + Eq {}

impl<T> VertexId for T where T: WireData + Ord + Hash + Eq {}

macro_rules! impl_wire_primitive {
    ($ty:ty, $put:ident, $get:ident, $width:expr) => {
        impl WireData for $ty {
            fn encode(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }

            fn decode(buf: &mut Bytes) -> Result<Self, GraphyneError> {
                if buf.remaining() < $width {
                    return Err(GraphyneError::Deserialization(format!(
                        "short buffer decoding {}",
                        stringify!($ty)
                    )));
                }
                Ok(buf.$get())
            }
        }
    };
}

impl_wire_primitive!(i32, put_i32, get_i32, 4);
impl_wire_primitive!(u32, put_u32, get_u32, 4);
impl_wire_primitive!(i64, put_i64, get_i64, 8);
impl_wire_primitive!(u64, put_u64, get_u64, 8);
impl_wire_primitive!(f32, put_f32, get_f32, 4);
impl_wire_primitive!(f64, put_f64, get_f64, 8);

impl WireData for () {
    fn encode(&self, _buf: &mut BytesMut) {}

    fn decode(_buf: &mut Bytes) -> Result<Self, GraphyneError> {
        Ok(())
    }
}

impl WireData for bool {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(*self));
    }

    fn decode(buf: &mut Bytes) -> Result<Self, GraphyneError> {
        if buf.remaining() < 1 {
            return Err(GraphyneError::Deserialization(
                "short buffer decoding bool".into(),
            ));
        }
        Ok(buf.get_u8() != 0)
    }
}

impl WireData for String {
    fn encode(&self, buf: &mut BytesMut) {
        put_blob(buf, self.as_bytes());
    }

    fn decode(buf: &mut Bytes) -> Result<Self, GraphyneError> {
        let blob = get_blob(buf)?;
        Ok(String::from_utf8(blob.to_vec())?)
    }
}

/// Appends a 4-byte length prefix followed by the raw bytes.
pub fn put_blob(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Consumes a 4-byte length prefix followed by that many raw bytes.
pub fn get_blob(buf: &mut Bytes) -> Result<Bytes, GraphyneError> {
    if buf.remaining() < 4 {
        return Err(GraphyneError::Deserialization(
            "short buffer decoding blob length".into(),
        ));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(GraphyneError::Deserialization(format!(
            "blob length {} exceeds remaining {}",
            len,
            buf.remaining()
        )));
    }
    Ok(buf.split_to(len))
}

/// Appends a value as a length-prefixed byte string.
pub fn put_data<T: WireData>(buf: &mut BytesMut, value: &T) {
    let mut inner = BytesMut::new();
    value.encode(&mut inner);
    put_blob(buf, &inner);
}

/// Consumes one length-prefixed byte string and decodes a value out of it.
pub fn get_data<T: WireData>(buf: &mut Bytes) -> Result<T, GraphyneError> {
    let mut blob = get_blob(buf)?;
    T::decode(&mut blob)
}

/// Appends a length-prefixed UTF-8 string (used for aggregator names and
/// kind identifiers on the wire).
pub fn put_utf(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

/// Consumes a length-prefixed UTF-8 string.
pub fn get_utf(buf: &mut Bytes) -> Result<String, GraphyneError> {
    let blob = get_blob(buf)?;
    Ok(String::from_utf8(blob.to_vec())?)
}

#[cfg(test)]
mod value_tests {
    use super::*;

    #[test]
    fn primitive_round_trips() -> Result<(), GraphyneError> {
        let mut buf = BytesMut::new();
        7i32.encode(&mut buf);
        (-77i64).encode(&mut buf);
        6.18f64.encode(&mut buf);
        true.encode(&mut buf);
        String::from("nice").encode(&mut buf);

        let mut bytes = buf.freeze();
        assert_eq!(i32::decode(&mut bytes)?, 7);
        assert_eq!(i64::decode(&mut bytes)?, -77);
        assert_eq!(f64::decode(&mut bytes)?, 6.18);
        assert!(bool::decode(&mut bytes)?);
        assert_eq!(String::decode(&mut bytes)?, "nice");
        assert!(bytes.is_empty());
        Ok(())
    }

    #[test]
    fn short_buffer_is_deserialization_error() {
        let mut bytes = Bytes::from_static(&[0, 0]);
        let res = i32::decode(&mut bytes);
        assert!(matches!(res, Err(GraphyneError::Deserialization(_))));
    }

    #[test]
    fn blob_round_trip() -> Result<(), GraphyneError> {
        let mut buf = BytesMut::new();
        put_data(&mut buf, &42i32);
        put_utf(&mut buf, "sum");

        let mut bytes = buf.freeze();
        assert_eq!(get_data::<i32>(&mut bytes)?, 42);
        assert_eq!(get_utf(&mut bytes)?, "sum");
        Ok(())
    }

    #[test]
    fn blob_length_overrun_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(100); // claims 100 bytes, provides 2
        buf.put_slice(&[1, 2]);
        let mut bytes = buf.freeze();
        assert!(get_blob(&mut bytes).is_err());
    }
}
