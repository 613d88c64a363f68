#![no_main]

use libfuzzer_sys::fuzz_target;
use livefeed_client::SubscribeDecoder;

fuzz_target!(|data: &[u8]| {
    // Feed newline-separated server messages through one decoder so the
    // column layout from a `Rows` message carries into later `Row`s.
    // Tests handling of:
    // - Malformed JSON and unknown message types
    // - Rows before (or without) a column layout
    // - Missing or non-numeric mz_* bookkeeping columns
    // - Row arity that disagrees with the layout
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };

    let mut decoder = SubscribeDecoder::new();
    for line in text.lines() {
        let _ = decoder.decode_text(line);
    }
});
