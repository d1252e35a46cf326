//! Small character-class and value checks shared by the config validator and
//! the envelope builder.

use regex::Regex;
use std::sync::LazyLock;

static RUN_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]*$").expect("Invalid run ID regex"));

static FILENAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]+\.[A-Za-z0-9]+$").expect("Invalid filename regex")
});

/// Validates an experiment run ID.
///
/// Run IDs may only contain ASCII letters, digits and underscores. The empty
/// string is valid and means "no run ID".
///
/// # Returns
///
/// * `Ok(())` if the run ID is valid.
/// * `Err(&'static str)` otherwise.
pub fn is_valid_run_id(run_id: &str) -> Result<(), &'static str> {
    if RUN_ID_PATTERN.is_match(run_id) {
        Ok(())
    } else {
        Err("Experiment run ID may only contain letters, numbers, and underscores")
    }
}

/// Validates an image filename of the form `name.ext`.
///
/// The name part is letters, digits and underscores; the extension is letters
/// and digits. An empty filename is rejected here, callers treat it as
/// "generate one for me" before calling this.
pub fn is_valid_filename(filename: &str) -> Result<(), &'static str> {
    if FILENAME_PATTERN.is_match(filename) {
        Ok(())
    } else {
        Err("Filename may only contain letters, numbers, and underscores followed by an extension")
    }
}

/// Rejects experiment, device and file IDs that are empty or all whitespace.
pub fn is_not_empty(id: &str) -> Result<(), &'static str> {
    if id.trim().is_empty() {
        return Err("ID cannot be empty or whitespace");
    }
    Ok(())
}

/// Validates that a rate or duration is finite and not negative.
pub fn is_non_negative(value: f64) -> Result<(), &'static str> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err("Value must be a finite number >= 0")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_alphabet() {
        assert!(is_valid_run_id("").is_ok());
        assert!(is_valid_run_id("run_01").is_ok());
        assert!(is_valid_run_id("RUN").is_ok());
        assert!(is_valid_run_id("run-01").is_err());
        assert!(is_valid_run_id("run 01").is_err());
        assert!(is_valid_run_id("über").is_err());
    }

    #[test]
    fn filename_pattern() {
        assert!(is_valid_filename("a_1.png").is_ok());
        assert!(is_valid_filename("IMG.JPG").is_ok());
        assert!(is_valid_filename("a b.png").is_err());
        assert!(is_valid_filename("a.tar.gz").is_err());
        assert!(is_valid_filename(".png").is_err());
        assert!(is_valid_filename("noext").is_err());
        assert!(is_valid_filename("").is_err());
    }

    #[test]
    fn non_negative() {
        assert!(is_non_negative(0.0).is_ok());
        assert!(is_non_negative(0.25).is_ok());
        assert!(is_non_negative(-1.0).is_err());
        assert!(is_non_negative(f64::NAN).is_err());
    }
}
