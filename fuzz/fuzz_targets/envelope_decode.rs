#![no_main]

use conquer_core::codec::{AckTracker, decode, should_dispatch};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 65_536 {
        return;
    }
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(envelope) = decode(text) else {
        return;
    };

    // a decoded envelope must survive a second trip through the codec
    let again = decode(&envelope.to_json()).expect("re-encoded envelope decodes");
    assert_eq!(again.num, envelope.num);
    assert_eq!(again.message_type, envelope.message_type);
    assert_eq!(again.id, envelope.id);

    let mut tracker = AckTracker::new();
    let before = tracker.last_seen();
    let status = tracker.observe(envelope.num);
    assert!(tracker.last_seen() >= before);
    let _ = should_dispatch(status, envelope.message_type);
});
