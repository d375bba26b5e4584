//! Storage backends for vector arithmetic.
//!
//! [`DenseBackend`] serves a single process. [`DistributedBackend`] treats the
//! local buffer as one shard of a larger array and completes reductions through
//! a [`Communicator`]; [`SerialComm`] is the one-process group.

use std::ops::Range;
use std::rc::Rc;

use nalgebra::{DVectorView, DVectorViewMut};
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::error::{Result, VectorError};
use crate::traits::{Communicator, VectorBackend};
use crate::vector::HashAlgorithm;

fn check_len(backend: &str, x: &[f64], y: &[f64]) -> Result<()> {
    if x.len() != y.len() {
        return Err(VectorError::SizeMismatch {
            context: backend.to_string(),
            what: "operand".to_string(),
            expected: y.len(),
            actual: x.len(),
        });
    }
    Ok(())
}

fn local_dot(x: &[f64], y: &[f64], relevant: &[Range<usize>]) -> f64 {
    relevant
        .iter()
        .map(|r| {
            let xv = DVectorView::from_slice(&x[r.clone()], r.len());
            let yv = DVectorView::from_slice(&y[r.clone()], r.len());
            xv.dot(&yv)
        })
        .sum()
}

fn local_norm_squared(x: &[f64], relevant: &[Range<usize>]) -> f64 {
    relevant
        .iter()
        .map(|r| DVectorView::from_slice(&x[r.clone()], r.len()).norm_squared())
        .sum()
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    let n = y.len();
    let xv = DVectorView::from_slice(x, n);
    let mut yv = DVectorViewMut::from_slice(y, n);
    yv.axpy(alpha, &xv, 1.0);
}

fn scale(alpha: f64, y: &mut [f64]) {
    let n = y.len();
    DVectorViewMut::from_slice(y, n).scale_mut(alpha);
}

/// Lowercase hex digest of the native-endian bytes of every plane.
pub(crate) fn digest_planes(planes: &[&[f64]], algorithm: HashAlgorithm) -> String {
    fn run<D: Digest>(planes: &[&[f64]]) -> String {
        let mut hasher = D::new();
        for plane in planes {
            for value in plane.iter() {
                hasher.update(value.to_ne_bytes());
            }
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    match algorithm {
        HashAlgorithm::Sha224 => run::<Sha224>(planes),
        HashAlgorithm::Sha256 => run::<Sha256>(planes),
        HashAlgorithm::Sha384 => run::<Sha384>(planes),
        HashAlgorithm::Sha512 => run::<Sha512>(planes),
    }
}

/// Contiguous single-process storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseBackend;

impl VectorBackend for DenseBackend {
    fn name(&self) -> &str {
        "Dense"
    }

    fn dot(&self, x: &[f64], y: &[f64], relevant: &[Range<usize>]) -> Result<f64> {
        check_len(self.name(), x, y)?;
        Ok(local_dot(x, y, relevant))
    }

    fn norm(&self, x: &[f64], relevant: &[Range<usize>]) -> Result<f64> {
        Ok(local_norm_squared(x, relevant).sqrt())
    }

    fn add_scaled(&self, alpha: f64, x: &[f64], y: &mut [f64]) -> Result<()> {
        check_len(self.name(), x, y)?;
        axpy(alpha, x, y);
        Ok(())
    }

    fn in_place_add(&self, x: &[f64], y: &mut [f64]) -> Result<()> {
        self.add_scaled(1.0, x, y)
    }

    fn in_place_subtract(&self, x: &[f64], y: &mut [f64]) -> Result<()> {
        self.add_scaled(-1.0, x, y)
    }

    fn in_place_scale(&self, alpha: f64, y: &mut [f64]) -> Result<()> {
        scale(alpha, y);
        Ok(())
    }

    fn copy_flat(&self, x: &[f64]) -> Result<Vec<f64>> {
        Ok(x.to_vec())
    }

    fn compute_hash(&self, planes: &[&[f64]], algorithm: HashAlgorithm) -> Result<String> {
        Ok(digest_planes(planes, algorithm))
    }
}

/// The trivial process group: one rank, reductions are the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn allreduce_sum(&self, local: f64) -> f64 {
        local
    }
}

/// One local shard of a distributed array.
///
/// Elementwise operators touch only the shard; reductions are summed over the
/// process group.
#[derive(Debug, Clone)]
pub struct DistributedBackend {
    comm: Rc<dyn Communicator>,
}

impl DistributedBackend {
    pub fn new(comm: Rc<dyn Communicator>) -> Self {
        Self { comm }
    }

    pub fn comm(&self) -> &dyn Communicator {
        self.comm.as_ref()
    }
}

impl VectorBackend for DistributedBackend {
    fn name(&self) -> &str {
        "Distributed"
    }

    fn is_distributed(&self) -> bool {
        true
    }

    fn dot(&self, x: &[f64], y: &[f64], relevant: &[Range<usize>]) -> Result<f64> {
        check_len(self.name(), x, y)?;
        Ok(self.comm.allreduce_sum(local_dot(x, y, relevant)))
    }

    fn norm(&self, x: &[f64], relevant: &[Range<usize>]) -> Result<f64> {
        Ok(self
            .comm
            .allreduce_sum(local_norm_squared(x, relevant))
            .sqrt())
    }

    fn add_scaled(&self, alpha: f64, x: &[f64], y: &mut [f64]) -> Result<()> {
        check_len(self.name(), x, y)?;
        axpy(alpha, x, y);
        Ok(())
    }

    fn in_place_add(&self, x: &[f64], y: &mut [f64]) -> Result<()> {
        self.add_scaled(1.0, x, y)
    }

    fn in_place_subtract(&self, x: &[f64], y: &mut [f64]) -> Result<()> {
        self.add_scaled(-1.0, x, y)
    }

    fn in_place_scale(&self, alpha: f64, y: &mut [f64]) -> Result<()> {
        scale(alpha, y);
        Ok(())
    }

    fn copy_flat(&self, x: &[f64]) -> Result<Vec<f64>> {
        Ok(x.to_vec())
    }

    /// Digest of the local shard, salted with the rank so equal shards on
    /// different ranks do not collide.
    fn compute_hash(&self, planes: &[&[f64]], algorithm: HashAlgorithm) -> Result<String> {
        let rank = [self.comm.rank() as f64];
        let mut salted: Vec<&[f64]> = Vec::with_capacity(planes.len() + 1);
        salted.push(&rank);
        salted.extend_from_slice(planes);
        Ok(digest_planes(&salted, algorithm))
    }
}
