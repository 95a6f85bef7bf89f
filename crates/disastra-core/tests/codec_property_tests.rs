//! Property-based tests for the envelope codec and the seen cache
//!
//! These tests verify the round-trip law of the wire format, that damaged
//! frames are always rejected, and that the seen cache admits every id
//! exactly once.

use std::collections::HashSet;

use disastra_core::{
    AckPayload, DecodeError, EmergencyType, EnvelopeCodec, GeoPoint, MessageEnvelope, MessageId,
    MessagePayload, Observation, SafePayload, SeenCache, SosPayload, Timestamp, Ttl,
    UpdatePayload,
};
use proptest::prelude::*;

fn arb_text() -> impl Strategy<Value = String> {
    prop_oneof![
        prop::string::string_regex(r"[a-zA-Z0-9 .,!?]{0,64}").unwrap(),
        "\\PC{0,24}",
    ]
}

fn arb_message_id() -> impl Strategy<Value = MessageId> {
    any::<[u8; 16]>().prop_map(MessageId::from_bytes)
}

fn arb_ttl() -> impl Strategy<Value = Ttl> {
    (any::<u8>(), any::<u32>()).prop_map(|(hops, lifetime_ms)| Ttl { hops, lifetime_ms })
}

fn arb_emergency_type() -> impl Strategy<Value = EmergencyType> {
    prop_oneof![
        Just(EmergencyType::Trapped),
        Just(EmergencyType::Medical),
        Just(EmergencyType::Fire),
        Just(EmergencyType::Unsafe),
        arb_text().prop_map(EmergencyType::Other),
    ]
}

fn arb_location() -> impl Strategy<Value = Option<GeoPoint>> {
    prop::option::of(
        (-90.0f64..90.0, -180.0f64..180.0, -500.0f64..9_000.0)
            .prop_map(|(lat, lon, alt)| GeoPoint::new(lat, lon, alt)),
    )
}

fn arb_payload() -> impl Strategy<Value = MessagePayload> {
    prop_oneof![
        (
            arb_emergency_type(),
            arb_location(),
            prop::option::of(0u8..=100),
            arb_text()
        )
            .prop_map(|(emergency_type, location, battery_percent, note)| {
                MessagePayload::Sos(SosPayload {
                    emergency_type,
                    location,
                    battery_percent,
                    note,
                })
            }),
        (arb_text(), arb_text(), arb_text()).prop_map(|(people, medical_supplies, additional_info)| {
            MessagePayload::Update(UpdatePayload {
                people,
                medical_supplies,
                additional_info,
            })
        }),
        (any::<u64>(), arb_text()).prop_map(|(at, note)| {
            MessagePayload::SafeNotice(SafePayload {
                marked_safe_at: Timestamp::new(at),
                note,
            })
        }),
        (arb_text(), arb_text())
            .prop_map(|(responder, note)| MessagePayload::Ack(AckPayload { responder, note })),
    ]
}

fn arb_envelope() -> impl Strategy<Value = MessageEnvelope> {
    (
        arb_message_id(),
        arb_message_id(),
        arb_payload(),
        any::<u64>(),
        arb_ttl(),
    )
        .prop_filter("correlation must differ from id", |(id, corr, ..)| id != corr)
        .prop_map(|(id, corr, payload, created_at, ttl)| {
            let correlation_id = match payload {
                MessagePayload::Sos(_) => None,
                _ => Some(corr),
            };
            MessageEnvelope {
                id,
                correlation_id,
                payload,
                created_at: Timestamp::new(created_at),
                ttl,
            }
        })
}

proptest! {
    /// Property: decode(encode(e)) == e for every valid envelope
    #[test]
    fn encode_decode_round_trip(envelope in arb_envelope()) {
        let bytes = EnvelopeCodec::encode(&envelope).unwrap();
        prop_assert_eq!(bytes.len(), EnvelopeCodec::encoded_len(&envelope).unwrap());
        let decoded = EnvelopeCodec::decode(&bytes).unwrap();
        prop_assert_eq!(decoded, envelope);
    }

    /// Property: any single damaged byte is caught
    #[test]
    fn corrupted_frames_rejected(
        envelope in arb_envelope(),
        position in any::<prop::sample::Index>(),
        mask in 1u8..=255,
    ) {
        let mut bytes = EnvelopeCodec::encode(&envelope).unwrap();
        let index = position.index(bytes.len());
        bytes[index] ^= mask;
        prop_assert!(EnvelopeCodec::decode(&bytes).is_err());
    }

    /// Property: every strict prefix of a frame is malformed
    #[test]
    fn truncated_frames_malformed(
        envelope in arb_envelope(),
        position in any::<prop::sample::Index>(),
    ) {
        let bytes = EnvelopeCodec::encode(&envelope).unwrap();
        let cut = position.index(bytes.len());
        let is_malformed = matches!(
            EnvelopeCodec::decode(&bytes[..cut]),
            Err(DecodeError::Malformed { .. })
        );
        prop_assert!(is_malformed);
    }

    /// Property: arbitrary input never panics the decoder
    #[test]
    fn decode_arbitrary_bytes(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = EnvelopeCodec::decode(&bytes);
    }

    /// Property: each distinct id is admitted exactly once
    #[test]
    fn seen_cache_admits_each_id_once(
        picks in prop::collection::vec(0usize..16, 1..200),
    ) {
        let ids: Vec<MessageId> = (0..16).map(|_| MessageId::new()).collect();
        let mut cache = SeenCache::new();
        let mut first_times = 0usize;

        for (tick, pick) in picks.iter().enumerate() {
            if cache.observe(ids[*pick], Timestamp::new(tick as u64)) == Observation::FirstTime {
                first_times += 1;
            }
        }

        let distinct: HashSet<usize> = picks.iter().copied().collect();
        prop_assert_eq!(first_times, distinct.len());
        prop_assert_eq!(cache.len(), distinct.len());
        prop_assert_eq!(cache.stats().duplicates as usize, picks.len() - distinct.len());
    }
}
