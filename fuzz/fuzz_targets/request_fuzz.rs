#![no_main]
use imagevol::NodeRequest;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(line) = std::str::from_utf8(data) {
        // Anything the server accepts must survive re-encoding unchanged
        if let Ok(request) = serde_json::from_str::<NodeRequest>(line) {
            let encoded = serde_json::to_string(&request).unwrap();
            let decoded: NodeRequest = serde_json::from_str(&encoded).unwrap();
            assert_eq!(request, decoded);
        }
    }
});
