//! Fuzz test for configuration loading
//!
//! Arbitrary TOML must yield a config or a `ConfigError`, never a panic, and
//! a config that validates must keep its entry size under the medium ceiling.
//!
//! Run with: cargo +nightly fuzz run config_fuzz -- -max_total_time=60

#![no_main]

use classbook_core::ClassbookConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(config) = ClassbookConfig::from_toml_str(input) {
            if config.validate().is_ok() {
                assert!(config.max_entry_bytes() < config.medium_ceiling_bytes());
                assert!(config.max_chunks() > 0);
                assert!(!config.lock_timeout().is_zero());
            }
        }
    }
});
