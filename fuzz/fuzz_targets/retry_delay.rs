#![no_main]

use docbuilder_retry::{BackoffConfig, BackoffStrategy, delay_for_attempt};
use libfuzzer_sys::fuzz_target;
use std::time::Duration;

fuzz_target!(|data: (u8, u64, u64, u8, u32)| {
    let (strategy_byte, initial_ms, max_ms, jitter_byte, attempt) = data;

    let strategy = match strategy_byte % 3 {
        0 => BackoffStrategy::Fixed,
        1 => BackoffStrategy::Linear,
        _ => BackoffStrategy::Exponential,
    };
    let initial = Duration::from_millis(initial_ms % 10_000 + 1);
    let max = Duration::from_millis(max_ms % 300_000 + 1);
    let jitter = (jitter_byte as f64) / 255.0;
    let attempt = attempt % 200 + 1;

    let config = BackoffConfig { strategy, initial, max, jitter, max_attempts: 50 };
    let delay = delay_for_attempt(&config, attempt);

    // The delay never exceeds the configured cap, jitter included: jitter
    // only ever shrinks or grows within `[1-jitter, 1+jitter]` before being
    // capped again, never past `config.max` outright.
    let worst_case_jitter = Duration::from_secs_f64(max.as_secs_f64() * (1.0 + jitter));
    assert!(delay <= max.max(worst_case_jitter));

    if jitter == 0.0 && strategy == BackoffStrategy::Fixed {
        assert_eq!(delay, initial.min(max));
    }
});
