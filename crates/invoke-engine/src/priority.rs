//! Invocation priority: named levels or any finite value in `[0, 100]`.
//!
//! Out-of-range or non-finite values are rejected synchronously at
//! `.set_priority` / `invoke` time, never inside the pipeline.

use crate::error::ValidationError;

/// An admissible priority value, validated at construction.
///
/// `0` is lowest, `100` is highest; ties break on submission order (see
/// [`crate::priority_queue`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(50);
    pub const HIGH: Priority = Priority(75);
    pub const CRITICAL: Priority = Priority(100);

    /// Validate a raw numeric priority. Rejects NaN/infinite values and
    /// anything outside `[0, 100]`.
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::new(format!(
                "priority must be a finite number, got {value}"
            )));
        }
        if !(0.0..=100.0).contains(&value) {
            return Err(ValidationError::new(format!(
                "priority must be in [0, 100], got {value}"
            )));
        }
        Ok(Priority(value.round() as u8))
    }

    /// Parse a named level (`"low"`, `"normal"`, `"high"`, `"critical"`),
    /// case-insensitively.
    pub fn from_name(name: &str) -> Result<Self, ValidationError> {
        match name.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::LOW),
            "normal" => Ok(Priority::NORMAL),
            "high" => Ok(Priority::HIGH),
            "critical" => Ok(Priority::CRITICAL),
            other => Err(ValidationError::new(format!(
                "unknown priority name: {other}"
            ))),
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<f64> for Priority {
    type Error = ValidationError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl TryFrom<u8> for Priority {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value as f64)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_values_are_admissible() {
        assert!(Priority::new(0.0).is_ok());
        assert!(Priority::new(100.0).is_ok());
    }

    #[test]
    fn out_of_range_is_rejected() {
        assert!(Priority::new(101.0).is_err());
        assert!(Priority::new(-1.0).is_err());
    }

    #[test]
    fn non_finite_is_rejected() {
        assert!(Priority::new(f64::NAN).is_err());
        assert!(Priority::new(f64::INFINITY).is_err());
    }

    #[test]
    fn named_levels_resolve() {
        assert_eq!(Priority::from_name("low").unwrap(), Priority::LOW);
        assert_eq!(Priority::from_name("HIGH").unwrap(), Priority::HIGH);
        assert!(Priority::from_name("urgent").is_err());
    }
}
