use std::fmt::Debug;
use std::ops::Range;

use crate::error::{Result, VectorError};
use crate::vector::HashAlgorithm;

/// Numeric capability set a storage backend provides to solvers.
///
/// Operators act on flat planes; `relevant` lists the position ranges that
/// take part in reductions. Every method defaults to
/// [`VectorError::UnimplementedOperation`], so a partial backend fails loudly
/// at the first operator it lacks.
pub trait VectorBackend: Debug {
    /// Name used in error messages.
    fn name(&self) -> &str;

    fn is_distributed(&self) -> bool {
        false
    }

    /// Inner product of `x` and `y` over the relevant ranges.
    fn dot(&self, _x: &[f64], _y: &[f64], _relevant: &[Range<usize>]) -> Result<f64> {
        Err(VectorError::unimplemented("dot", self.name()))
    }

    /// Euclidean norm of `x` over the relevant ranges.
    fn norm(&self, _x: &[f64], _relevant: &[Range<usize>]) -> Result<f64> {
        Err(VectorError::unimplemented("norm", self.name()))
    }

    /// y += alpha * x
    fn add_scaled(&self, _alpha: f64, _x: &[f64], _y: &mut [f64]) -> Result<()> {
        Err(VectorError::unimplemented("add_scaled", self.name()))
    }

    /// y += x
    fn in_place_add(&self, _x: &[f64], _y: &mut [f64]) -> Result<()> {
        Err(VectorError::unimplemented("in_place_add", self.name()))
    }

    /// y -= x
    fn in_place_subtract(&self, _x: &[f64], _y: &mut [f64]) -> Result<()> {
        Err(VectorError::unimplemented("in_place_subtract", self.name()))
    }

    /// y *= alpha
    fn in_place_scale(&self, _alpha: f64, _y: &mut [f64]) -> Result<()> {
        Err(VectorError::unimplemented("in_place_scale", self.name()))
    }

    /// Owned copy of the local data.
    fn copy_flat(&self, _x: &[f64]) -> Result<Vec<f64>> {
        Err(VectorError::unimplemented("copy_flat", self.name()))
    }

    /// Hex digest of the byte representation of `planes`.
    fn compute_hash(&self, _planes: &[&[f64]], _algorithm: HashAlgorithm) -> Result<String> {
        Err(VectorError::unimplemented("compute_hash", self.name()))
    }
}

/// Collective operations a distributed backend needs from its process group.
pub trait Communicator: Debug {
    fn rank(&self) -> usize;

    fn size(&self) -> usize;

    /// Sum of `local` over every process, returned on all of them.
    fn allreduce_sum(&self, local: f64) -> f64;
}
