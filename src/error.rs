// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types for the GST estimation core.

use std::fmt;

/// Result type alias for GST operations.
pub type Result<T> = std::result::Result<T, Error>;

/// GST error types.
#[derive(Debug)]
pub enum Error {
    /// A vector or matrix had the wrong length/shape
    Dimension {
        context: String,
        expected: usize,
        actual: usize,
    },
    /// A gauge transformation is not a member of the model's gauge group
    GaugeCompatibility(String),
    /// No evaluation-tree grouping fits within the cache budget
    UnsupportedLength { requested: usize, limit: usize },
    /// Optimizer failure
    Optimization(OptimizationFailure),
    /// Validation error
    Validation(ValidationError),
    /// A factorization or eigensolver failed
    Numerical(String),
    /// A circuit or outcome references a label the model does not define
    UnknownLabel(String),
    /// Configuration error
    Config(String),
    /// IO error
    Io(std::io::Error),
    /// Serialization error
    Serialization(String),
}

impl Error {
    /// Shorthand for a [`Error::Dimension`] error.
    pub fn dimension(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Error::Dimension {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Whether the driver may retry after this error.
    ///
    /// Only optimizer failures are retryable; dimension and gauge errors are
    /// programmer errors and always fatal.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Optimization(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Dimension {
                context,
                expected,
                actual,
            } => write!(
                f,
                "Dimension error: {}: expected {}, got {}",
                context, expected, actual
            ),
            Error::GaugeCompatibility(msg) => write!(f, "Gauge compatibility error: {}", msg),
            Error::UnsupportedLength { requested, limit } => write!(
                f,
                "Unsupported length: evaluation requires {} cached products, limit is {}",
                requested, limit
            ),
            Error::Optimization(e) => write!(f, "Optimization failure: {}", e),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Numerical(msg) => write!(f, "Numerical error: {}", msg),
            Error::UnknownLabel(label) => write!(f, "Unknown label: {}", label),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Optimization(e) => Some(e),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<OptimizationFailure> for Error {
    fn from(e: OptimizationFailure) -> Self {
        Error::Optimization(e)
    }
}

impl From<ValidationError> for Error {
    fn from(e: ValidationError) -> Self {
        Error::Validation(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Optimizer failures.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationFailure {
    /// Damped normal equations could not be solved after repeated damping increases
    SingularSystem { attempts: usize },
    /// Damping grew past its ceiling without finding a descent step
    Divergence { damping: f64 },
    /// Iteration cap reached (only an error when configured as one)
    IterationCap { iterations: usize },
    /// The objective evaluated to NaN or infinity
    InvalidCost(String),
}

impl fmt::Display for OptimizationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimizationFailure::SingularSystem { attempts } => {
                write!(f, "singular normal equations after {} attempts", attempts)
            }
            OptimizationFailure::Divergence { damping } => {
                write!(f, "damping exceeded maximum ({:.3e})", damping)
            }
            OptimizationFailure::IterationCap { iterations } => {
                write!(f, "iteration cap of {} reached", iterations)
            }
            OptimizationFailure::InvalidCost(msg) => write!(f, "invalid cost: {}", msg),
        }
    }
}

impl std::error::Error for OptimizationFailure {}

/// Validation errors.
#[derive(Debug)]
pub enum ValidationError {
    /// Field validation failed
    Field { field: String, message: String },
    /// A circuit required by an iteration list has no data
    MissingData { circuit: String },
    /// Resource limit exceeded
    ResourceLimit {
        resource: String,
        limit: u64,
        requested: u64,
    },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Field { field, message } => {
                write!(f, "Field '{}': {}", field, message)
            }
            ValidationError::MissingData { circuit } => {
                write!(f, "No data for circuit {}", circuit)
            }
            ValidationError::ResourceLimit {
                resource,
                limit,
                requested,
            } => {
                write!(
                    f,
                    "Resource limit exceeded for {}: limit={}, requested={}",
                    resource, limit, requested
                )
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    // =========================================================================
    // Error Display tests
    // =========================================================================

    #[test]
    fn test_error_display_dimension() {
        let e = Error::dimension("parameter vector", 43, 40);
        assert_eq!(
            e.to_string(),
            "Dimension error: parameter vector: expected 43, got 40"
        );
    }

    #[test]
    fn test_error_display_gauge() {
        let e = Error::GaugeCompatibility("first row must be [1,0,0,0]".into());
        assert_eq!(
            e.to_string(),
            "Gauge compatibility error: first row must be [1,0,0,0]"
        );
    }

    #[test]
    fn test_error_display_unsupported_length() {
        let e = Error::UnsupportedLength {
            requested: 500,
            limit: 10,
        };
        assert_eq!(
            e.to_string(),
            "Unsupported length: evaluation requires 500 cached products, limit is 10"
        );
    }

    #[test]
    fn test_error_display_optimization() {
        let e = Error::Optimization(OptimizationFailure::SingularSystem { attempts: 20 });
        assert_eq!(
            e.to_string(),
            "Optimization failure: singular normal equations after 20 attempts"
        );
    }

    #[test]
    fn test_error_display_unknown_label() {
        let e = Error::UnknownLabel("Gz".into());
        assert_eq!(e.to_string(), "Unknown label: Gz");
    }

    #[test]
    fn test_error_display_numerical() {
        let e = Error::Numerical("solve: singular matrix".into());
        assert_eq!(e.to_string(), "Numerical error: solve: singular matrix");
    }

    #[test]
    fn test_error_display_config() {
        let e = Error::Config("bad tolerance".into());
        assert_eq!(e.to_string(), "Configuration error: bad tolerance");
    }

    #[test]
    fn test_error_display_io() {
        let e = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert_eq!(e.to_string(), "IO error: gone");
    }

    // =========================================================================
    // OptimizationFailure / ValidationError Display tests
    // =========================================================================

    #[test]
    fn test_optimization_failure_display_iteration_cap() {
        let e = OptimizationFailure::IterationCap { iterations: 100 };
        assert_eq!(e.to_string(), "iteration cap of 100 reached");
    }

    #[test]
    fn test_optimization_failure_display_invalid_cost() {
        let e = OptimizationFailure::InvalidCost("NaN".into());
        assert_eq!(e.to_string(), "invalid cost: NaN");
    }

    #[test]
    fn test_validation_error_display_missing_data() {
        let e = ValidationError::MissingData {
            circuit: "GxGy".into(),
        };
        assert_eq!(e.to_string(), "No data for circuit GxGy");
    }

    #[test]
    fn test_validation_error_display_resource_limit() {
        let e = ValidationError::ResourceLimit {
            resource: "circuits".into(),
            limit: 1000,
            requested: 2000,
        };
        assert_eq!(
            e.to_string(),
            "Resource limit exceeded for circuits: limit=1000, requested=2000"
        );
    }

    // =========================================================================
    // Error::source() and classification
    // =========================================================================

    #[test]
    fn test_error_source_optimization() {
        let e = Error::Optimization(OptimizationFailure::Divergence { damping: 1e13 });
        assert!(e.source().is_some());
    }

    #[test]
    fn test_error_source_none_for_dimension() {
        let e = Error::dimension("x", 1, 2);
        assert!(e.source().is_none());
    }

    #[test]
    fn test_only_optimization_errors_are_retryable() {
        assert!(Error::Optimization(OptimizationFailure::SingularSystem { attempts: 1 })
            .is_retryable());
        assert!(!Error::dimension("x", 1, 2).is_retryable());
        assert!(!Error::GaugeCompatibility("x".into()).is_retryable());
    }

    // =========================================================================
    // From impls
    // =========================================================================

    #[test]
    fn test_from_validation_error() {
        let ve = ValidationError::Field {
            field: "counts".into(),
            message: "negative".into(),
        };
        let e: Error = ve.into();
        assert!(matches!(e, Error::Validation(_)));
    }

    #[test]
    fn test_from_serde_yaml_error() {
        let yaml_err = serde_yaml::from_str::<serde_yaml::Value>("{{{{").unwrap_err();
        let e: Error = yaml_err.into();
        assert!(matches!(e, Error::Serialization(_)));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let e: Error = json_err.into();
        assert!(matches!(e, Error::Serialization(_)));
    }
}
