//! Fuzz target for the TOML configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data)
        && let Ok(config) = perch_config::AppConfig::parse(s)
    {
        // Anything that validates must serialize and parse back unchanged
        let text = config.to_toml().expect("valid config serializes");
        let reparsed = perch_config::AppConfig::parse(&text).expect("serialized config parses");
        assert_eq!(config, reparsed);
    }
});
