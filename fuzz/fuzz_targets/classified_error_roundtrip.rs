#![no_main]

use docbuilder_types::{ClassifiedError, Job, RepoHash};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(json_str) = std::str::from_utf8(data) else { return };

    if let Ok(error) = serde_json::from_str::<ClassifiedError>(json_str) {
        if let Ok(encoded) = serde_json::to_string(&error) {
            let parsed: ClassifiedError = serde_json::from_str(&encoded).expect("roundtrip encode is itself valid json");
            assert_eq!(error.category, parsed.category);
            assert_eq!(error.message, parsed.message);
        }
    }

    if let Ok(job) = serde_json::from_str::<Job>(json_str) {
        if let Ok(encoded) = serde_json::to_string(&job) {
            let parsed: Job = serde_json::from_str(&encoded).expect("roundtrip encode is itself valid json");
            assert_eq!(job.id, parsed.id);
            assert_eq!(job.repo, parsed.repo);
        }
    }

    if let Ok(hash) = serde_json::from_str::<RepoHash>(json_str) {
        if let Ok(encoded) = serde_json::to_string(&hash) {
            let parsed: RepoHash = serde_json::from_str(&encoded).expect("roundtrip encode is itself valid json");
            assert_eq!(hash.name, parsed.name);
            assert_eq!(hash.hash, parsed.hash);
        }
    }
});
