//! Request validation utilities.

use std::time::Duration;

use crate::types::{Error, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that a value is positive.
pub fn validate_positive(n: u64, field: &str) -> Result<()> {
    if n == 0 {
        return Err(Error::validation(format!("{} must be positive", field)));
    }
    Ok(())
}

/// Validate that a duration is non-zero.
pub fn validate_positive_duration(d: Duration, field: &str) -> Result<()> {
    if d.is_zero() {
        return Err(Error::validation(format!("{} must be positive", field)));
    }
    Ok(())
}
