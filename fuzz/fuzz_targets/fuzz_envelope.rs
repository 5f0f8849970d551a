#![no_main]

use libfuzzer_sys::fuzz_target;
use peer_transport::Envelope;

fuzz_target!(|data: &[u8]| {
    // Fuzz envelope decoding of untrusted bodies
    let _ = Envelope::decode(data);
});
