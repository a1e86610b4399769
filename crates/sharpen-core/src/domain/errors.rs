pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("coefficient array '{field}' length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("d-spacing at index {index} must be finite and > 0, got {value}")]
    InvalidDSpacing { index: usize, value: f64 },
    #[error("amplitude at index {index} must be finite and >= 0, got {value}")]
    InvalidAmplitude { index: usize, value: f64 },
    #[error("direction vector ({x}, {y}, {z}) has zero length")]
    ZeroDirectionVector { x: f64, y: f64, z: f64 },
    #[error("resolution must be finite and > 0, got {value}")]
    InvalidResolution { value: f64 },
}
