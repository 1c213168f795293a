// Configuration validation

use crate::{ConfigError, Result};

/// Trait for validating configuration
pub trait Validate {
    fn validate(&self) -> Result<()>;
}

/// Reusable validation rules
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate that a value is not empty
    pub fn not_empty(value: &str, field: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!("{} cannot be empty", field)));
        }
        Ok(())
    }

    /// Validate that a number is strictly positive
    pub fn positive(value: i64, field: &str) -> Result<()> {
        if value <= 0 {
            return Err(ConfigError::ValidationError(format!(
                "{} must be a positive integer, got {}",
                field, value
            )));
        }
        Ok(())
    }

    /// Validate that `value >= floor`
    pub fn at_least<T: PartialOrd + std::fmt::Display>(
        value: T,
        floor: T,
        field: &str,
        floor_field: &str,
    ) -> Result<()> {
        if value < floor {
            return Err(ConfigError::ValidationError(format!(
                "{} ({}) must be >= {} ({})",
                field, value, floor_field, floor
            )));
        }
        Ok(())
    }

    /// Validate that a number is within range
    pub fn in_range<T: PartialOrd + std::fmt::Display>(
        value: T,
        min: T,
        max: T,
        field: &str,
    ) -> Result<()> {
        if value < min || value > max {
            return Err(ConfigError::ValidationError(format!(
                "{} must be between {} and {}, got {}",
                field, min, max, value
            )));
        }
        Ok(())
    }

    /// Validate that a value is in a list of allowed values
    pub fn one_of(value: &str, allowed: &[&str], field: &str) -> Result<()> {
        if !allowed.contains(&value) {
            return Err(ConfigError::ValidationError(format!(
                "{} must be one of {:?}, got {:?}",
                field, allowed, value
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_empty_validation() {
        assert!(ConfigValidator::not_empty("value", "field").is_ok());
        assert!(ConfigValidator::not_empty("  ", "field").is_err());
    }

    #[test]
    fn test_positive_validation() {
        assert!(ConfigValidator::positive(1, "per_second").is_ok());
        assert!(ConfigValidator::positive(0, "per_second").is_err());
        assert!(ConfigValidator::positive(-5, "per_second").is_err());
    }

    #[test]
    fn test_at_least_validation() {
        assert!(ConfigValidator::at_least(20, 10, "burst", "per_second").is_ok());
        assert!(ConfigValidator::at_least(10, 10, "burst", "per_second").is_ok());

        let err = ConfigValidator::at_least(5, 10, "burst", "per_second").unwrap_err();
        assert!(err.to_string().contains("burst (5) must be >= per_second (10)"));
    }

    #[test]
    fn test_range_validation() {
        assert!(ConfigValidator::in_range(5, 1, 10, "field").is_ok());
        assert!(ConfigValidator::in_range(0, 1, 10, "field").is_err());
        assert!(ConfigValidator::in_range(11, 1, 10, "field").is_err());
    }

    #[test]
    fn test_one_of_validation() {
        let allowed = ["legacy", "hybrid"];
        assert!(ConfigValidator::one_of("legacy", &allowed, "field").is_ok());
        assert!(ConfigValidator::one_of("other", &allowed, "field").is_err());
    }
}
