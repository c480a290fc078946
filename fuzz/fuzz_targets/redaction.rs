#![no_main]

use std::borrow::Cow;

use crashkeep_core::redact::Redactor;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let text = String::from_utf8_lossy(data);
    let redactor = Redactor::new();
    match redactor.redact_cow(&text) {
        Cow::Borrowed(clean) => assert_eq!(clean, text.as_ref()),
        Cow::Owned(scrubbed) => assert!(scrubbed.contains(crashkeep_core::redact::REDACTED)),
    }
});
