//! Fuzz target for configuration validation: arbitrary text and run IDs must
//! produce a result, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mdml_client::config::validate;

fuzz_target!(|input: (&str, &str)| {
    let (text, run_id) = input;
    if let Ok(config) = validate(text, run_id) {
        assert!(!config.experiment_id().is_empty());
        assert!(config.as_text().starts_with('{'));
    }
});
