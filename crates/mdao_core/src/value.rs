//! Shaped values exchanged with the vector layer.
//!
//! A variable's rank is carried explicitly by its [`Shape`]: a rank-0 shape is a
//! scalar, and every accessor returns the declared shape instead of guessing
//! scalar-ness from the element count.

use std::fmt;

use num_complex::Complex64;
use num_traits::Zero;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorError};

/// Row-major dimensions of a variable. The empty shape is a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    pub fn scalar() -> Self {
        Self(Vec::new())
    }

    pub fn vector(len: usize) -> Self {
        Self(vec![len])
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of elements. A scalar holds one.
    pub fn size(&self) -> usize {
        self.0.iter().product()
    }

    /// Number of elements in one entry along the first axis.
    pub fn row_size(&self) -> usize {
        self.0.iter().skip(1).product()
    }

    /// Row-major flat offset of a multi-index, or `None` when out of range.
    pub fn flat_index(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.0.len() {
            return None;
        }
        let mut offset = 0;
        for (&i, &dim) in index.iter().zip(&self.0) {
            if i >= dim {
                return None;
            }
            offset = offset * dim + i;
        }
        Some(offset)
    }

    /// For every element of `target`, the flat index of the element of a
    /// value with this shape that broadcasting reads. Dimensions are aligned
    /// from the right and each must match or be 1; `None` when they do not.
    pub fn broadcast_positions(&self, target: &Shape) -> Option<Vec<usize>> {
        let src = &self.0;
        let tgt = &target.0;
        if src.len() > tgt.len() {
            return None;
        }
        let lead = tgt.len() - src.len();
        if src
            .iter()
            .zip(&tgt[lead..])
            .any(|(&s, &t)| s != t && s != 1)
        {
            return None;
        }

        let mut strides = vec![0; src.len()];
        let mut acc = 1;
        for axis in (0..src.len()).rev() {
            strides[axis] = if src[axis] == 1 { 0 } else { acc };
            acc *= src[axis];
        }

        let mut index = vec![0; tgt.len()];
        let mut out = Vec::with_capacity(target.size());
        for _ in 0..target.size() {
            out.push(
                strides
                    .iter()
                    .zip(&index[lead..])
                    .map(|(stride, i)| stride * i)
                    .sum(),
            );
            for axis in (0..tgt.len()).rev() {
                index[axis] += 1;
                if index[axis] < tgt[axis] {
                    break;
                }
                index[axis] = 0;
            }
        }
        Some(out)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, dim) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{dim}")?;
        }
        if self.0.len() == 1 {
            write!(f, ",")?;
        }
        write!(f, ")")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

/// An owned, row-major n-dimensional value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    shape: Shape,
    data: Vec<T>,
}

impl<T> Tensor<T> {
    pub fn new(shape: impl Into<Shape>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        if shape.size() != data.len() {
            return Err(VectorError::SizeMismatch {
                context: "Tensor".to_string(),
                what: format!("data for shape {shape}"),
                expected: shape.size(),
                actual: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn scalar(value: T) -> Self {
        Self {
            shape: Shape::scalar(),
            data: vec![value],
        }
    }

    /// A one-dimensional tensor over `data`.
    pub fn from_vec(data: Vec<T>) -> Self {
        Self {
            shape: Shape::vector(data.len()),
            data,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    pub fn get(&self, index: &[usize]) -> Option<&T> {
        self.shape.flat_index(index).map(|i| &self.data[i])
    }

    pub fn map<U>(&self, f: impl FnMut(&T) -> U) -> Tensor<U> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(f).collect(),
        }
    }

    pub(crate) fn reshaped(self, shape: Shape) -> Self {
        debug_assert_eq!(shape.size(), self.data.len());
        Self {
            shape,
            data: self.data,
        }
    }
}

impl<T: Copy> Tensor<T> {
    /// The single element of a rank-0 tensor.
    pub fn as_scalar(&self) -> Option<T> {
        if self.shape.is_scalar() {
            self.data.first().copied()
        } else {
            None
        }
    }
}

impl<T: Zero + Clone> Tensor<T> {
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let data = vec![T::zero(); shape.size()];
        Self { shape, data }
    }
}

/// The result of a named read: real outside complex step, complex under it.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Real(Tensor<f64>),
    Complex(Tensor<Complex64>),
}

impl Value {
    pub(crate) fn zeros(shape: Shape, complex: bool) -> Self {
        if complex {
            Value::Complex(Tensor::zeros(shape))
        } else {
            Value::Real(Tensor::zeros(shape))
        }
    }

    pub fn shape(&self) -> &Shape {
        match self {
            Value::Real(t) => t.shape(),
            Value::Complex(t) => t.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_scalar(&self) -> bool {
        self.shape().is_scalar()
    }

    pub fn is_complex(&self) -> bool {
        matches!(self, Value::Complex(_))
    }

    pub fn as_real(&self) -> Option<&Tensor<f64>> {
        match self {
            Value::Real(t) => Some(t),
            Value::Complex(_) => None,
        }
    }

    pub fn as_complex(&self) -> Option<&Tensor<Complex64>> {
        match self {
            Value::Complex(t) => Some(t),
            Value::Real(_) => None,
        }
    }

    /// Real part, whatever the variant.
    pub fn real(&self) -> Tensor<f64> {
        match self {
            Value::Real(t) => t.clone(),
            Value::Complex(t) => t.map(|z| z.re),
        }
    }

    /// Imaginary part; zeros for a real value.
    pub fn imag(&self) -> Tensor<f64> {
        match self {
            Value::Real(t) => t.map(|_| 0.0),
            Value::Complex(t) => t.map(|z| z.im),
        }
    }

    pub fn to_complex(&self) -> Tensor<Complex64> {
        match self {
            Value::Real(t) => t.map(|&re| Complex64::new(re, 0.0)),
            Value::Complex(t) => t.clone(),
        }
    }

    /// Real scalar shortcut, `None` for arrays.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Real(t) => t.as_scalar(),
            Value::Complex(t) => t.as_scalar().map(|z| z.re),
        }
    }

    pub fn as_complex_scalar(&self) -> Option<Complex64> {
        match self {
            Value::Real(t) => t.as_scalar().map(|re| Complex64::new(re, 0.0)),
            Value::Complex(t) => t.as_scalar(),
        }
    }
}

impl PartialEq<f64> for Value {
    fn eq(&self, other: &f64) -> bool {
        matches!(self, Value::Real(t) if t.as_scalar() == Some(*other))
    }
}

impl PartialEq<Complex64> for Value {
    fn eq(&self, other: &Complex64) -> bool {
        matches!(self, Value::Complex(t) if t.as_scalar() == Some(*other))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(Tensor::scalar(value))
    }
}

impl From<Complex64> for Value {
    fn from(value: Complex64) -> Self {
        Value::Complex(Tensor::scalar(value))
    }
}

impl From<Vec<f64>> for Value {
    fn from(data: Vec<f64>) -> Self {
        Value::Real(Tensor::from_vec(data))
    }
}

impl From<&[f64]> for Value {
    fn from(data: &[f64]) -> Self {
        Value::Real(Tensor::from_vec(data.to_vec()))
    }
}

impl<const N: usize> From<[f64; N]> for Value {
    fn from(data: [f64; N]) -> Self {
        Value::Real(Tensor::from_vec(data.to_vec()))
    }
}

impl From<Vec<Complex64>> for Value {
    fn from(data: Vec<Complex64>) -> Self {
        Value::Complex(Tensor::from_vec(data))
    }
}

impl From<Tensor<f64>> for Value {
    fn from(t: Tensor<f64>) -> Self {
        Value::Real(t)
    }
}

impl From<Tensor<Complex64>> for Value {
    fn from(t: Tensor<Complex64>) -> Self {
        Value::Complex(t)
    }
}

/// A shaped, borrowed window into a flat buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorView<'a> {
    shape: Shape,
    data: &'a [f64],
}

impl<'a> TensorView<'a> {
    pub(crate) fn new(shape: Shape, data: &'a [f64]) -> Self {
        debug_assert_eq!(shape.size(), data.len());
        Self { shape, data }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &'a [f64] {
        self.data
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_scalar()
    }

    pub fn as_scalar(&self) -> Option<f64> {
        if self.shape.is_scalar() {
            self.data.first().copied()
        } else {
            None
        }
    }

    pub fn get(&self, index: &[usize]) -> Option<f64> {
        self.shape.flat_index(index).map(|i| self.data[i])
    }

    pub fn to_tensor(&self) -> Tensor<f64> {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.to_vec(),
        }
    }
}

/// Mutable counterpart of [`TensorView`].
#[derive(Debug, PartialEq)]
pub struct TensorViewMut<'a> {
    shape: Shape,
    data: &'a mut [f64],
}

impl<'a> TensorViewMut<'a> {
    pub(crate) fn new(shape: Shape, data: &'a mut [f64]) -> Self {
        debug_assert_eq!(shape.size(), data.len());
        Self { shape, data }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &*self.data
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut *self.data
    }

    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    pub fn get_mut(&mut self, index: &[usize]) -> Option<&mut f64> {
        self.shape.flat_index(index).map(|i| &mut self.data[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_shape_has_one_element_and_rank_zero() {
        let shape = Shape::scalar();
        assert!(shape.is_scalar());
        assert_eq!(shape.rank(), 0);
        assert_eq!(shape.size(), 1);
        assert_eq!(shape.to_string(), "()");
        assert_eq!(Shape::vector(3).to_string(), "(3,)");
        assert_eq!(Shape::new([2, 3]).to_string(), "(2, 3)");
    }

    #[test]
    fn flat_index_is_row_major() {
        let shape = Shape::new([2, 3]);
        assert_eq!(shape.flat_index(&[0, 0]), Some(0));
        assert_eq!(shape.flat_index(&[1, 0]), Some(3));
        assert_eq!(shape.flat_index(&[1, 2]), Some(5));
        assert_eq!(shape.flat_index(&[2, 0]), None);
        assert_eq!(shape.flat_index(&[0]), None);
        assert_eq!(shape.row_size(), 3);
    }

    #[test]
    fn broadcasting_aligns_trailing_dimensions() {
        let row = Shape::vector(2);
        assert_eq!(
            row.broadcast_positions(&Shape::new([3, 2])),
            Some(vec![0, 1, 0, 1, 0, 1])
        );
        assert_eq!(
            Shape::new([3, 1]).broadcast_positions(&Shape::new([3, 2])),
            Some(vec![0, 0, 1, 1, 2, 2])
        );
        assert_eq!(
            Shape::vector(1).broadcast_positions(&Shape::vector(3)),
            Some(vec![0, 0, 0])
        );
        assert_eq!(
            Shape::scalar().broadcast_positions(&Shape::new([2, 2])),
            Some(vec![0; 4])
        );
        assert_eq!(Shape::vector(3).broadcast_positions(&Shape::new([3, 2])), None);
        assert_eq!(Shape::new([2, 2]).broadcast_positions(&Shape::vector(2)), None);
    }

    #[test]
    fn tensor_new_rejects_wrong_length() {
        let err = Tensor::new(Shape::new([2, 2]), vec![1.0, 2.0, 3.0]).expect_err("size mismatch");
        assert!(matches!(
            err,
            VectorError::SizeMismatch {
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn value_parts_follow_variant() {
        let v = Value::from(Complex64::new(1.0, 2.0));
        assert!(v.is_scalar());
        assert!(v.is_complex());
        assert_eq!(v.real().as_scalar(), Some(1.0));
        assert_eq!(v.imag().as_scalar(), Some(2.0));
        assert_eq!(v.as_f64(), Some(1.0));

        let r = Value::from(vec![1.0, 2.0]);
        assert!(!r.is_scalar());
        assert_eq!(r.imag().data(), &[0.0, 0.0]);
        assert_eq!(r.as_f64(), None);
        assert_eq!(Value::from(2.5), 2.5);
        assert_ne!(r, 2.5);
    }
}
