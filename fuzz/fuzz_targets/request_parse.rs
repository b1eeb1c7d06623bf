#![no_main]

use libfuzzer_sys::fuzz_target;

use cacheproxy::proxy::cache::CacheKey;
use cacheproxy::proxy::request::parse_request;

fuzz_target!(|data: &[u8]| {
    let Ok(request) = parse_request(data) else {
        return;
    };
    assert!(!request.host.is_empty());
    assert!(request.path.starts_with('/'));
    assert_eq!(request.host, request.host.to_ascii_lowercase());

    let key = CacheKey::for_request(&request);
    assert!(key.entry_id().chars().all(|c| c.is_ascii_hexdigit()));
});
