//! Envelope codec: explicit, versioned binary layout
//!
//! Body layout (big-endian, no padding), carried inside a length-prefixed
//! frame (see `frame.rs`):
//! [1]    version (0x01)
//! [2+N]  id           (u16 length + UTF-8)
//! [2+N]  group        (u16 length + UTF-8)
//! [2+N]  object_id    (u16 length + UTF-8)
//! [2+N]  instance_id  (u16 length + UTF-8)
//! [2+N]  metadata     (u16 length + UTF-8)
//! [4+N]  payload      (u32 length + bytes)
//! [8]    expiration   (i64)

use super::{Envelope, WireError};

/// Current wire format version
pub const WIRE_VERSION: u8 = 0x01;

/// Smallest possible body: version + five empty strings + empty payload + expiration
pub const MIN_BODY_LEN: usize = 1 + 5 * 2 + 4 + 8;

/// Serialize an envelope body
///
/// Returns `Err(FieldTooLong)` if a string field exceeds `u16::MAX` bytes or
/// the payload exceeds `u32::MAX` bytes.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(encoded_len(envelope));
    encode_into(envelope, &mut buf)?;
    Ok(buf)
}

/// Body size of `envelope` once encoded
pub fn encoded_len(envelope: &Envelope) -> usize {
    MIN_BODY_LEN
        + envelope.id().len()
        + envelope.group().len()
        + envelope.object_id().len()
        + envelope.instance_id().len()
        + envelope.metadata().len()
        + envelope.payload().len()
}

/// Append an encoded envelope body to `buf`
pub fn encode_into(envelope: &Envelope, buf: &mut Vec<u8>) -> Result<(), WireError> {
    buf.push(WIRE_VERSION);
    put_str(buf, "id", envelope.id())?;
    put_str(buf, "group", envelope.group())?;
    put_str(buf, "object_id", envelope.object_id())?;
    put_str(buf, "instance_id", envelope.instance_id())?;
    put_str(buf, "metadata", envelope.metadata())?;

    let payload = envelope.payload();
    let payload_len = u32::try_from(payload.len()).map_err(|_| WireError::FieldTooLong {
        field: "payload",
        len: payload.len(),
    })?;
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(payload);

    buf.extend_from_slice(&envelope.expiration().to_be_bytes());
    Ok(())
}

/// Deserialize an envelope body
///
/// Returns error if:
/// - Buffer too short for any declared field
/// - Unknown version
/// - A string field is not UTF-8
/// - Bytes remain after the expiration field
pub fn decode_envelope(data: &[u8]) -> Result<Envelope, WireError> {
    if data.is_empty() {
        return Err(WireError::EmptyFrame);
    }

    let mut reader = Reader { data, offset: 0 };

    let version = reader.take(1)?[0];
    if version != WIRE_VERSION {
        return Err(WireError::InvalidVersion(version));
    }

    let id = reader.string("id")?;
    let group = reader.string("group")?;
    let object_id = reader.string("object_id")?;
    let instance_id = reader.string("instance_id")?;
    let metadata = reader.string("metadata")?;

    let payload_len = reader.u32()? as usize;
    let payload = reader.take(payload_len)?.to_vec();

    let expiration = i64::from_be_bytes(reader.array::<8>()?);

    let remaining = data.len() - reader.offset;
    if remaining != 0 {
        return Err(WireError::TrailingBytes(remaining));
    }

    Ok(Envelope::builder(id, group)
        .object_id(object_id)
        .instance_id(instance_id)
        .metadata(metadata)
        .payload(payload)
        .expiration(expiration)
        .build())
}

fn put_str(buf: &mut Vec<u8>, field: &'static str, value: &str) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::FieldTooLong {
        field,
        len: value.len(),
    })?;
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.offset.checked_add(len).ok_or(WireError::BufferTooShort {
            need: usize::MAX,
            got: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(WireError::BufferTooShort {
                need: end,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_be_bytes(self.array::<4>()?))
    }

    fn string(&mut self, field: &'static str) -> Result<String, WireError> {
        let len = u16::from_be_bytes(self.array::<2>()?) as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8 { field })
    }
}

// ============================================================================
// TESTS
// ============================================================================
