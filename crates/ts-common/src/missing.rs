//! Canonical missing-value marker.
//!
//! Readers and the missing-value normaliser map every declared sentinel onto
//! [`MISSING_VALUE`]; the store persists it as SQL `NULL`.

/// The canonical in-memory marker for a missing event value.
pub const MISSING_VALUE: f64 = f64::NAN;

/// Returns `true` when the value is the canonical missing marker.
pub fn is_missing(value: f64) -> bool {
    value.is_nan()
}

/// Convert an event value into its persisted form.
pub fn to_stored(value: f64) -> Option<f64> {
    if is_missing(value) {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_marker_is_missing() {
        assert!(is_missing(MISSING_VALUE));
        assert!(!is_missing(-999.0));
    }

    #[test]
    fn test_to_stored() {
        assert_eq!(to_stored(MISSING_VALUE), None);
        assert_eq!(to_stored(30.0), Some(30.0));
    }
}
