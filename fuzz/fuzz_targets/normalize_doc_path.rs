#![no_main]

use docbuilder_git::normalize_doc_path;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &str| {
    let normalized = normalize_doc_path(data);

    // Normalization is idempotent and never reintroduces a leading `./`,
    // leading `/`, or trailing `/`.
    assert_eq!(normalize_doc_path(&normalized), normalized);
    assert!(!normalized.starts_with("./"));
    assert!(!normalized.starts_with('/'));
    assert!(!normalized.ends_with('/') || normalized.is_empty());
});
