//! Property-based tests for the length-prefix framing
//!
//! These check header decoding against the size ceilings and that the codec
//! recovers message boundaries however the byte stream is chunked.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use peer_transport::config::{MAX_MESSAGE_SIZE, MAX_UNAUTH_MESSAGE_SIZE};
use peer_transport::core::framing::{decode_header, encode_header, frame, CONTINUATION_BIT};
use peer_transport::{FrameCodec, ProtocolError, SizeLimits};
use proptest::prelude::*;
use tokio_util::codec::{Decoder, Encoder};

// Property: the reserved top bit never changes the decoded length
proptest! {
    #[test]
    fn prop_continuation_bit_is_ignored(length in 1u32..=MAX_UNAUTH_MESSAGE_SIZE as u32) {
        let limits = SizeLimits::default();
        let plain = decode_header(&length.to_be_bytes(), false, &limits).unwrap();
        let flagged = decode_header(&(length | CONTINUATION_BIT).to_be_bytes(), false, &limits).unwrap();
        prop_assert_eq!(plain, flagged);
        prop_assert_eq!(plain, length as usize);
    }
}

// Property: lengths between the two ceilings are accepted only once authenticated
proptest! {
    #[test]
    fn prop_ceiling_depends_on_authentication(
        length in (MAX_UNAUTH_MESSAGE_SIZE + 1)..=MAX_MESSAGE_SIZE
    ) {
        let limits = SizeLimits::default();
        let header = encode_header(length);

        let rejected = decode_header(&header, false, &limits);
        prop_assert!(
            matches!(rejected, Err(ProtocolError::MessageTooLarge { limit, .. }) if limit == MAX_UNAUTH_MESSAGE_SIZE),
            "unauthenticated peer accepted {} bytes",
            length
        );
        prop_assert_eq!(decode_header(&header, true, &limits).unwrap(), length);
    }
}

// Property: nothing over the absolute ceiling is ever accepted
proptest! {
    #[test]
    fn prop_absolute_ceiling(length in (MAX_MESSAGE_SIZE as u32 + 1)..CONTINUATION_BIT) {
        let result = decode_header(&length.to_be_bytes(), true, &SizeLimits::default());
        prop_assert!(
            matches!(result, Err(ProtocolError::MessageTooLarge { .. })),
            "accepted {} bytes",
            length
        );
    }
}

// Property: message boundaries survive arbitrary chunking of the stream
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn prop_codec_recovers_boundaries(
        bodies in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..512), 1..16),
        chunk in 1usize..64,
    ) {
        let mut codec = FrameCodec::new(SizeLimits::default());
        let mut wire = BytesMut::new();
        for body in &bodies {
            codec.encode(Bytes::from(body.clone()), &mut wire).unwrap();
        }

        let mut decoded = Vec::new();
        let mut buf = BytesMut::new();
        for piece in wire.chunks(chunk) {
            buf.extend_from_slice(piece);
            while let Some(body) = codec.decode(&mut buf).unwrap() {
                decoded.push(body.to_vec());
            }
        }

        prop_assert!(buf.is_empty());
        prop_assert_eq!(decoded, bodies);
    }
}

#[test]
fn test_zero_length_header_is_malformed() {
    let mut codec = FrameCodec::new(SizeLimits::default());
    let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 1, 2][..]);
    assert!(matches!(
        codec.decode(&mut buf),
        Err(ProtocolError::MalformedLength(0))
    ));
}

#[test]
fn test_frame_refuses_empty_and_oversized_bodies() {
    assert!(frame(&[], MAX_MESSAGE_SIZE).is_err());
    assert!(matches!(
        frame(&[0u8; 65], 64),
        Err(ProtocolError::MessageTooLarge { length: 65, limit: 64 })
    ));

    let framed = frame(b"abc", MAX_MESSAGE_SIZE).unwrap();
    assert_eq!(&framed[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
}

#[test]
fn test_authenticated_codec_accepts_large_frames() {
    let body = vec![1u8; MAX_UNAUTH_MESSAGE_SIZE + 1];
    let mut wire = BytesMut::new();
    let mut codec = FrameCodec::new(SizeLimits::default());
    codec.encode(Bytes::from(body.clone()), &mut wire).unwrap();

    let mut unauthenticated = wire.clone();
    assert!(codec.decode(&mut unauthenticated).is_err());

    codec.set_authenticated(true);
    let decoded = codec.decode(&mut wire).unwrap().unwrap();
    assert_eq!(decoded.len(), body.len());
}
