#![no_main]

use crashkeep_core::config::{Config, MAX_GRACE_PERIOD_MS};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = Config::from_toml(text) else {
        return;
    };
    assert!(config.dispatch.grace_period_ms <= MAX_GRACE_PERIOD_MS);

    // An accepted config survives its own rendering unchanged.
    let rendered = config.to_toml().expect("valid config serializes");
    let reparsed = Config::from_toml(&rendered).expect("rendered config parses");
    assert_eq!(reparsed.to_toml().expect("serializes"), rendered);
});
