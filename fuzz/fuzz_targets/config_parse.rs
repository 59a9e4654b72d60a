#![no_main]

use docbuilder_config::Config;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else { return };
    if let Ok(config) = toml::from_str::<Config>(text) {
        // A config that parses must either validate cleanly or fail with a
        // classified validation error — it must never panic.
        let _ = config.validate();
    }
});
