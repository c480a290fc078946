#![no_main]

use crashkeep_core::record::RecordId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(name) = std::str::from_utf8(data) else {
        return;
    };

    // Anything that parses must render back to the exact same name, so two
    // distinct files can never map to one record id.
    if let Some(id) = RecordId::parse_file_name(name, "log") {
        assert_eq!(id.file_name("log"), name);
    }
    if let Some(id) = RecordId::parse_stem(name) {
        assert_eq!(id.file_stem(), name);
        assert_eq!(RecordId::parse_file_name(&id.file_name("log"), "log"), Some(id));
    }
});
