//! Fuzz target for the control socket frame decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_message_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use perch_core::ipc::Decoder;

fuzz_target!(|data: &[u8]| {
    let mut decoder = Decoder::new();
    for &byte in data {
        match decoder.push(byte) {
            Ok(Some(message)) => {
                // Decoded fields never carry delimiters, so they re-encode
                let frame = message.encode().expect("decoded message encodes");
                let mut again = Decoder::new();
                let mut decoded = None;
                for &b in &frame {
                    decoded = again.push(b).expect("encoded frame decodes");
                }
                assert_eq!(decoded, Some(message));
            }
            Ok(None) => {}
            Err(_) => decoder = Decoder::new(),
        }
    }
});
