//! Whole-vector arithmetic, dispatched to the backend.
//!
//! Operands are addressed by flat position and must have the same length.
//! Elementwise operators touch the imaginary plane only under complex step;
//! reductions honour the relevance set.

use std::ops::Range;
use std::rc::Rc;

use super::{HashAlgorithm, Vector, VectorData};
use crate::error::{Result, VectorError};
use crate::traits::VectorBackend;

impl Vector<'_> {
    /// Local position ranges of the relevant variables, merged where adjacent.
    pub(crate) fn relevant_ranges(&self) -> Vec<Range<usize>> {
        let Some(names) = &self.relevant else {
            return vec![0..self.len];
        };
        let mut ranges: Vec<Range<usize>> = Vec::new();
        for (name, view) in &self.views {
            if !names.contains(name) {
                continue;
            }
            let range = view.range();
            match ranges.last_mut() {
                Some(last) if last.end == range.start => last.end = range.end,
                _ => ranges.push(range),
            }
        }
        ranges
    }

    fn check_operand(&self, other: &Vector<'_>, op: &str) -> Result<()> {
        if other.len != self.len {
            return Err(VectorError::SizeMismatch {
                context: self.context(),
                what: format!("operand of {op}"),
                expected: self.len,
                actual: other.len,
            });
        }
        Ok(())
    }

    /// Applies `f(backend, x, y)` plane by plane with `other` as `x` and this
    /// vector as `y`. When both alias the same buffer the source is copied
    /// first.
    fn zip_planes<F>(&mut self, other: &Vector<'_>, op: &str, f: F) -> Result<()>
    where
        F: Fn(&dyn VectorBackend, &[f64], &mut [f64]) -> Result<()>,
    {
        self.check_operand(other, op)?;
        let src_range = other.range();
        let use_imag = other.under_complex_step;

        if Rc::ptr_eq(&self.data, &other.data) {
            let (x_re, x_im) = {
                let src = other.data()?;
                let x_im = if use_imag {
                    src.imag.as_ref().map(|v| v[src_range.clone()].to_vec())
                } else {
                    None
                };
                (src.real[src_range].to_vec(), x_im)
            };
            self.apply_planes(&x_re, x_im.as_deref(), f)
        } else {
            let src = other.data()?;
            let x_im = if use_imag {
                src.imag.as_ref().map(|v| &v[src_range.clone()])
            } else {
                None
            };
            self.apply_planes(&src.real[src_range], x_im, f)
        }
    }

    fn apply_planes<F>(&self, x_re: &[f64], x_im: Option<&[f64]>, f: F) -> Result<()>
    where
        F: Fn(&dyn VectorBackend, &[f64], &mut [f64]) -> Result<()>,
    {
        let range = self.range();
        let backend = self.backend.as_ref();
        let mut dst = self.data_mut()?;
        let VectorData { real, imag, .. } = &mut *dst;
        f(backend, x_re, &mut real[range.clone()])?;
        if self.under_complex_step {
            if let (Some(imag), Some(x_im)) = (imag.as_mut(), x_im) {
                f(backend, x_im, &mut imag[range])?;
            }
        }
        Ok(())
    }

    /// self += alpha * other
    pub fn add_scaled(&mut self, alpha: f64, other: &Vector<'_>) -> Result<()> {
        self.zip_planes(other, "add_scaled", |b, x, y| b.add_scaled(alpha, x, y))
    }

    /// self += other
    pub fn in_place_add(&mut self, other: &Vector<'_>) -> Result<()> {
        self.zip_planes(other, "in_place_add", |b, x, y| b.in_place_add(x, y))
    }

    /// self -= other
    pub fn in_place_subtract(&mut self, other: &Vector<'_>) -> Result<()> {
        self.zip_planes(other, "in_place_subtract", |b, x, y| {
            b.in_place_subtract(x, y)
        })
    }

    /// self *= alpha
    pub fn in_place_scale(&mut self, alpha: f64) -> Result<()> {
        let range = self.range();
        let mut dst = self.data_mut()?;
        let VectorData { real, imag, .. } = &mut *dst;
        self.backend.in_place_scale(alpha, &mut real[range.clone()])?;
        if self.under_complex_step {
            if let Some(imag) = imag.as_mut() {
                self.backend.in_place_scale(alpha, &mut imag[range])?;
            }
        }
        Ok(())
    }

    /// Inner product over the relevant variables of this vector.
    ///
    /// Under complex step this is the real part of the unconjugated product,
    /// `re·re - im·im`.
    pub fn dot(&self, other: &Vector<'_>) -> Result<f64> {
        self.check_operand(other, "dot")?;
        let ranges = self.relevant_ranges();
        let x = self.data()?;
        let y = other.data()?;
        let (xr, yr) = (self.range(), other.range());

        let mut result = self
            .backend
            .dot(&x.real[xr.clone()], &y.real[yr.clone()], &ranges)?;
        if self.under_complex_step && other.under_complex_step {
            if let (Some(xi), Some(yi)) = (x.imag.as_ref(), y.imag.as_ref()) {
                result -= self.backend.dot(&xi[xr], &yi[yr], &ranges)?;
            }
        }
        Ok(result)
    }

    /// Euclidean norm over the relevant variables, combining both planes
    /// under complex step.
    pub fn norm(&self) -> Result<f64> {
        let ranges = self.relevant_ranges();
        let data = self.data()?;
        let range = self.range();

        let re = self.backend.norm(&data.real[range.clone()], &ranges)?;
        if !self.under_complex_step {
            return Ok(re);
        }
        match data.imag.as_ref() {
            Some(imag) => Ok(re.hypot(self.backend.norm(&imag[range], &ranges)?)),
            None => Ok(re),
        }
    }

    /// Hex digest of the stored values using the configured algorithm.
    pub fn compute_hash(&self) -> Result<String> {
        self.compute_hash_with(self.settings.hash_algorithm)
    }

    pub fn compute_hash_with(&self, algorithm: HashAlgorithm) -> Result<String> {
        let data = self.data()?;
        let range = self.range();
        let real = &data.real[range.clone()];
        match (self.under_complex_step, data.imag.as_ref()) {
            (true, Some(imag)) => self.backend.compute_hash(&[real, &imag[range]], algorithm),
            _ => self.backend.compute_hash(&[real], algorithm),
        }
    }
}
