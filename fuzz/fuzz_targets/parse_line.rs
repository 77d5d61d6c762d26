#![no_main]

use libfuzzer_sys::fuzz_target;
use rankflame::folded::parse_line;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        if let Ok(record) = parse_line(line) {
            assert!(record.count > 0);
            assert!(record.stack.frames().all(|frame| !frame.is_empty()));
        }
    }
});
