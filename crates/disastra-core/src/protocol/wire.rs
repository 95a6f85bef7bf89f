//! Binary wire format for emergency envelopes
//!
//! All integers are big endian. A frame is laid out as:
//!
//! ```text
//! magic "DS" (2) | version (1) | kind (1) | flags (1)
//! id (16) | [correlation id (16)] | created_at (8) | ttl hops (1) | ttl lifetime ms (4)
//! body length (2) | body | crc32 (4)
//! ```
//!
//! The checksum covers every byte before it. Strings inside the body are
//! `u16` length-prefixed UTF-8.

use core::convert::TryInto;

use tracing::trace;

use crate::errors::{DecodeError, RelayError, Result};
use crate::protocol::envelope::{
    AckPayload, EmergencyType, EnvelopeKind, GeoPoint, MessageEnvelope, MessagePayload,
    SafePayload, SosPayload, UpdatePayload,
};
use crate::types::{MessageId, Timestamp, Ttl};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

pub const MAGIC: [u8; 2] = *b"DS";

pub const WIRE_VERSION: u8 = 1;

/// Flag bit set when a correlation id follows the message id
pub const FLAG_HAS_CORRELATION: u8 = 0b0000_0001;

const KNOWN_FLAGS: u8 = FLAG_HAS_CORRELATION;

const ID_SIZE: usize = 16;

const CRC_SIZE: usize = 4;

/// Fixed bytes of a frame without correlation id or body
pub const MIN_FRAME_SIZE: usize = 2 + 1 + 1 + 1 + ID_SIZE + 8 + 1 + 4 + 2 + CRC_SIZE;

/// Largest body a frame can describe
pub const MAX_BODY_SIZE: usize = u16::MAX as usize;

const EMERGENCY_TRAPPED: u8 = 1;
const EMERGENCY_MEDICAL: u8 = 2;
const EMERGENCY_FIRE: u8 = 3;
const EMERGENCY_UNSAFE: u8 = 4;
const EMERGENCY_OTHER: u8 = 0xFF;

// ----------------------------------------------------------------------------
// Envelope Codec
// ----------------------------------------------------------------------------

/// Stateless encoder/decoder for `MessageEnvelope`
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Encode an envelope into a checksummed frame
    pub fn encode(envelope: &MessageEnvelope) -> Result<Vec<u8>> {
        envelope.validate()?;

        let body = encode_body(&envelope.payload)?;
        if body.len() > MAX_BODY_SIZE {
            return Err(RelayError::PayloadTooLarge {
                size: body.len(),
                max: MAX_BODY_SIZE,
            });
        }

        let mut flags = 0u8;
        if envelope.correlation_id.is_some() {
            flags |= FLAG_HAS_CORRELATION;
        }

        let mut bytes = Vec::with_capacity(Self::encoded_len_hint(envelope) + body.len());
        bytes.extend_from_slice(&MAGIC);
        bytes.push(WIRE_VERSION);
        bytes.push(envelope.kind().tag());
        bytes.push(flags);
        bytes.extend_from_slice(envelope.id.as_bytes());
        if let Some(corr) = envelope.correlation_id {
            bytes.extend_from_slice(corr.as_bytes());
        }
        bytes.extend_from_slice(&envelope.created_at.as_millis().to_be_bytes());
        bytes.push(envelope.ttl.hops);
        bytes.extend_from_slice(&envelope.ttl.lifetime_ms.to_be_bytes());
        bytes.extend_from_slice(&(body.len() as u16).to_be_bytes());
        bytes.extend_from_slice(&body);

        let crc = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());

        Ok(bytes)
    }

    /// Decode a frame produced by [`EnvelopeCodec::encode`]
    ///
    /// The checksum is verified before the kind tag is interpreted, so an
    /// `UnknownKind` error always refers to an intact frame.
    pub fn decode(bytes: &[u8]) -> core::result::Result<MessageEnvelope, DecodeError> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(DecodeError::malformed(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }

        let (content, trailer) = bytes.split_at(bytes.len() - CRC_SIZE);
        let expected = u32::from_be_bytes(
            trailer
                .try_into()
                .map_err(|_| DecodeError::malformed("invalid checksum trailer"))?,
        );
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(DecodeError::malformed(format!(
                "checksum mismatch: expected {expected:08x}, got {actual:08x}"
            )));
        }

        let mut reader = Reader::new(content);

        if reader.take(2)? != MAGIC {
            return Err(DecodeError::malformed("bad magic"));
        }

        let version = reader.u8()?;
        if version != WIRE_VERSION {
            return Err(DecodeError::malformed(format!(
                "unsupported wire version {version}"
            )));
        }

        let tag = reader.u8()?;
        let kind = EnvelopeKind::from_tag(tag).ok_or(DecodeError::UnknownKind { tag })?;

        let flags = reader.u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(DecodeError::malformed(format!(
                "unknown flag bits {flags:#04x}"
            )));
        }

        let id = reader.message_id()?;
        let correlation_id = if flags & FLAG_HAS_CORRELATION != 0 {
            Some(reader.message_id()?)
        } else {
            None
        };

        if kind.requires_correlation() != correlation_id.is_some() {
            return Err(DecodeError::malformed(format!(
                "correlation flag inconsistent with kind {kind}"
            )));
        }

        let created_at = Timestamp::new(reader.u64()?);
        let ttl = Ttl {
            hops: reader.u8()?,
            lifetime_ms: reader.u32()?,
        };

        let body_len = reader.u16()? as usize;
        let body = reader.take(body_len)?;
        if !reader.is_empty() {
            return Err(DecodeError::malformed(format!(
                "{} bytes of trailing data",
                reader.remaining()
            )));
        }

        let payload = decode_body(kind, body)?;

        trace!(message_id = %id, %kind, size = bytes.len(), "Decoded envelope");

        Ok(MessageEnvelope {
            id,
            correlation_id,
            payload,
            created_at,
            ttl,
        })
    }

    /// Size of the encoded frame, without building it
    pub fn encoded_len(envelope: &MessageEnvelope) -> Result<usize> {
        let body = encode_body(&envelope.payload)?;
        Ok(Self::encoded_len_hint(envelope) + body.len())
    }

    fn encoded_len_hint(envelope: &MessageEnvelope) -> usize {
        MIN_FRAME_SIZE
            + if envelope.correlation_id.is_some() {
                ID_SIZE
            } else {
                0
            }
    }
}

// ----------------------------------------------------------------------------
// Body Encoding
// ----------------------------------------------------------------------------

fn encode_body(payload: &MessagePayload) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    match payload {
        MessagePayload::Sos(sos) => {
            match &sos.emergency_type {
                EmergencyType::Trapped => body.push(EMERGENCY_TRAPPED),
                EmergencyType::Medical => body.push(EMERGENCY_MEDICAL),
                EmergencyType::Fire => body.push(EMERGENCY_FIRE),
                EmergencyType::Unsafe => body.push(EMERGENCY_UNSAFE),
                EmergencyType::Other(other) => {
                    body.push(EMERGENCY_OTHER);
                    put_str(&mut body, other)?;
                }
            }
            match &sos.location {
                Some(point) => {
                    body.push(1);
                    body.extend_from_slice(&point.latitude.to_bits().to_be_bytes());
                    body.extend_from_slice(&point.longitude.to_bits().to_be_bytes());
                    body.extend_from_slice(&point.altitude.to_bits().to_be_bytes());
                }
                None => body.push(0),
            }
            match sos.battery_percent {
                Some(percent) => {
                    body.push(1);
                    body.push(percent);
                }
                None => body.push(0),
            }
            put_str(&mut body, &sos.note)?;
        }
        MessagePayload::Update(update) => {
            put_str(&mut body, &update.people)?;
            put_str(&mut body, &update.medical_supplies)?;
            put_str(&mut body, &update.additional_info)?;
        }
        MessagePayload::SafeNotice(safe) => {
            body.extend_from_slice(&safe.marked_safe_at.as_millis().to_be_bytes());
            put_str(&mut body, &safe.note)?;
        }
        MessagePayload::Ack(ack) => {
            put_str(&mut body, &ack.responder)?;
            put_str(&mut body, &ack.note)?;
        }
    }
    Ok(body)
}

fn put_str(buf: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(RelayError::PayloadTooLarge {
            size: bytes.len(),
            max: u16::MAX as usize,
        });
    }
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

fn decode_body(
    kind: EnvelopeKind,
    body: &[u8],
) -> core::result::Result<MessagePayload, DecodeError> {
    let mut reader = Reader::new(body);
    let payload = match kind {
        EnvelopeKind::Sos => {
            let emergency_type = match reader.u8()? {
                EMERGENCY_TRAPPED => EmergencyType::Trapped,
                EMERGENCY_MEDICAL => EmergencyType::Medical,
                EMERGENCY_FIRE => EmergencyType::Fire,
                EMERGENCY_UNSAFE => EmergencyType::Unsafe,
                EMERGENCY_OTHER => EmergencyType::Other(reader.string()?),
                other => {
                    return Err(DecodeError::malformed(format!(
                        "unknown emergency type {other}"
                    )))
                }
            };
            let location = if reader.flag()? {
                Some(GeoPoint {
                    latitude: f64::from_bits(reader.u64()?),
                    longitude: f64::from_bits(reader.u64()?),
                    altitude: f64::from_bits(reader.u64()?),
                })
            } else {
                None
            };
            let battery_percent = if reader.flag()? {
                Some(reader.u8()?)
            } else {
                None
            };
            MessagePayload::Sos(SosPayload {
                emergency_type,
                location,
                battery_percent,
                note: reader.string()?,
            })
        }
        EnvelopeKind::Update => MessagePayload::Update(UpdatePayload {
            people: reader.string()?,
            medical_supplies: reader.string()?,
            additional_info: reader.string()?,
        }),
        EnvelopeKind::SafeNotice => MessagePayload::SafeNotice(SafePayload {
            marked_safe_at: Timestamp::new(reader.u64()?),
            note: reader.string()?,
        }),
        EnvelopeKind::Ack => MessagePayload::Ack(AckPayload {
            responder: reader.string()?,
            note: reader.string()?,
        }),
    };

    if !reader.is_empty() {
        return Err(DecodeError::malformed(format!(
            "{} unread body bytes",
            reader.remaining()
        )));
    }
    Ok(payload)
}

// ----------------------------------------------------------------------------
// Frame Reader
// ----------------------------------------------------------------------------

/// Bounds-checked cursor over a byte slice
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, len: usize) -> core::result::Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::malformed(format!(
                "truncated: needed {len} bytes at offset {}, {} left",
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> core::result::Result<[u8; N], DecodeError> {
        self.take(N)?
            .try_into()
            .map_err(|_| DecodeError::malformed("short read"))
    }

    fn u8(&mut self) -> core::result::Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn flag(&mut self) -> core::result::Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::malformed(format!("invalid presence flag {other}"))),
        }
    }

    fn u16(&mut self) -> core::result::Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> core::result::Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> core::result::Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn message_id(&mut self) -> core::result::Result<MessageId, DecodeError> {
        Ok(MessageId::from_bytes(self.array()?))
    }

    fn string(&mut self) -> core::result::Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| DecodeError::malformed(format!("invalid utf-8: {e}")))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
