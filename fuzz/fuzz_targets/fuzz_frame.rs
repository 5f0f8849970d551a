#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use peer_transport::{FrameCodec, SizeLimits};
use tokio_util::codec::Decoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary stream bytes: decoding may fail but must never panic or over-read
    let mut codec = FrameCodec::new(SizeLimits::default());
    let mut buf = BytesMut::from(data);
    while let Ok(Some(body)) = codec.decode(&mut buf) {
        assert!(!body.is_empty());
        assert!(body.len() <= SizeLimits::default().unauthenticated);
    }
});
