//! Identity and configuration types for vectors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The solver context a vector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorName {
    Nonlinear,
    Linear,
}

/// What a vector stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorKind {
    Input,
    Output,
    Residual,
}

/// Variable family addressed by a vector. Residuals live alongside outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoType {
    Input,
    Output,
}

impl VectorKind {
    pub fn io_type(self) -> IoType {
        match self {
            VectorKind::Input => IoType::Input,
            VectorKind::Output | VectorKind::Residual => IoType::Output,
        }
    }
}

impl fmt::Display for VectorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VectorName::Nonlinear => "nonlinear",
            VectorName::Linear => "linear",
        })
    }
}

impl fmt::Display for VectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VectorKind::Input => "input",
            VectorKind::Output => "output",
            VectorKind::Residual => "residual",
        })
    }
}

/// Direction of a derivative computation, which decides how linear vectors
/// are scaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleDirection {
    #[default]
    Fwd,
    Rev,
}

/// Digest used by `compute_hash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    Sha224,
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

/// Per-vector construction options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorSettings {
    /// Allocate the imaginary plane needed for complex step.
    pub alloc_complex: bool,
    pub read_only: bool,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for VectorSettings {
    fn default() -> Self {
        Self {
            alloc_complex: false,
            read_only: false,
            hash_algorithm: HashAlgorithm::Sha256,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residuals_share_output_io_type() {
        assert_eq!(VectorKind::Residual.io_type(), IoType::Output);
        assert_eq!(VectorKind::Output.io_type(), IoType::Output);
        assert_eq!(VectorKind::Input.io_type(), IoType::Input);
    }

    #[test]
    fn settings_fill_missing_fields_with_defaults() {
        let settings: VectorSettings =
            serde_json::from_str(r#"{"alloc_complex": true}"#).expect("valid settings");
        assert!(settings.alloc_complex);
        assert!(!settings.read_only);
        assert_eq!(settings.hash_algorithm, HashAlgorithm::Sha256);

        let settings: VectorSettings =
            serde_json::from_str(r#"{"hash_algorithm": "sha512"}"#).expect("valid settings");
        assert_eq!(settings.hash_algorithm, HashAlgorithm::Sha512);
    }
}
