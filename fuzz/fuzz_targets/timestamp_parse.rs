#![no_main]

use libfuzzer_sys::fuzz_target;
use livefeed_core::Timestamp;

fuzz_target!(|data: &[u8]| {
    // Timestamps arrive as JSON strings or numbers; neither form may panic,
    // and any parsed value must either render or report out-of-range.
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
        if let Ok(ts) = Timestamp::try_from(&value) {
            let _ = ts.to_iso8601();
        }
    }
    if let Ok(text) = std::str::from_utf8(data) {
        let _ = text.parse::<Timestamp>();
    }
});
