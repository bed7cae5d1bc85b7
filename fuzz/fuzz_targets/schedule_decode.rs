#![no_main]

use conquer_core::serializer::{deserialize_schedule, serialize_schedule};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() > 65_536 {
        return;
    }
    let Ok(payload) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let Ok(schedule) = deserialize_schedule(&payload) else {
        return;
    };

    let again = deserialize_schedule(&serialize_schedule(&schedule))
        .expect("serialized schedule decodes");
    assert_eq!(again, schedule);
});
