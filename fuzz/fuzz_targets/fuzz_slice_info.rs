#![no_main]

use bufuse_fusion::OpCalcInfo;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(text) = std::str::from_utf8(data) {
        // Whatever parses must encode and parse back to the same value.
        if let Ok(info) = OpCalcInfo::from_json(text) {
            let encoded = info.to_json().expect("parsed slice info encodes");
            assert_eq!(OpCalcInfo::from_json(&encoded).ok(), Some(info));
        }
    }
});
