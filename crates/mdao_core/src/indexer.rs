//! Index expressions over a variable's storage.
//!
//! An [`Indexer`] targets either the flattened variable (`flat_src`) or its
//! shaped form, in which case slices and integer lists select entries along the
//! first axis. Resolution produces both the flat element positions and the shape
//! of the selected block.

use serde::{Deserialize, Serialize};

use crate::error::{Result, VectorError};
use crate::value::Shape;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexExpr {
    Full,
    Slice {
        start: Option<isize>,
        stop: Option<isize>,
        step: Option<isize>,
    },
    Indices(Vec<isize>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Indexer {
    expr: IndexExpr,
    flat_src: bool,
}

/// A resolved index: positions into the flat variable plus the selected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub flat: Vec<usize>,
    pub shape: Shape,
}

impl Indexer {
    pub const FULL: Indexer = Indexer {
        expr: IndexExpr::Full,
        flat_src: false,
    };

    pub const FLAT_FULL: Indexer = Indexer {
        expr: IndexExpr::Full,
        flat_src: true,
    };

    pub fn full(flat_src: bool) -> Self {
        Self {
            expr: IndexExpr::Full,
            flat_src,
        }
    }

    pub fn slice(
        start: Option<isize>,
        stop: Option<isize>,
        step: Option<isize>,
        flat_src: bool,
    ) -> Self {
        Self {
            expr: IndexExpr::Slice { start, stop, step },
            flat_src,
        }
    }

    pub fn indices(indices: Vec<isize>, flat_src: bool) -> Self {
        Self {
            expr: IndexExpr::Indices(indices),
            flat_src,
        }
    }

    pub fn expr(&self) -> &IndexExpr {
        &self.expr
    }

    pub fn flat_src(&self) -> bool {
        self.flat_src
    }

    /// True when every element is selected, allowing callers to skip
    /// materializing positions.
    pub fn is_full(&self) -> bool {
        matches!(self.expr, IndexExpr::Full)
    }

    /// Resolves against a variable of the given shape.
    pub fn resolve(&self, shape: &Shape) -> Result<Selection> {
        let size = shape.size();
        if self.flat_src {
            let flat = self.positions(size)?;
            let shape = Shape::vector(flat.len());
            return Ok(Selection { flat, shape });
        }

        if self.is_full() {
            return Ok(Selection {
                flat: (0..size).collect(),
                shape: shape.clone(),
            });
        }

        if shape.is_scalar() {
            return Err(VectorError::InvalidIndex(
                "a scalar variable only accepts the full index".to_string(),
            ));
        }

        let rows = self.positions(shape.dims()[0])?;
        let row_size = shape.row_size();
        let mut flat = Vec::with_capacity(rows.len() * row_size);
        for row in &rows {
            let base = row * row_size;
            flat.extend(base..base + row_size);
        }
        let mut dims = shape.dims().to_vec();
        dims[0] = rows.len();
        Ok(Selection {
            flat,
            shape: Shape::new(dims),
        })
    }

    /// Positions selected along an axis of length `len`.
    fn positions(&self, len: usize) -> Result<Vec<usize>> {
        match &self.expr {
            IndexExpr::Full => Ok((0..len).collect()),
            IndexExpr::Indices(indices) => indices
                .iter()
                .map(|&i| normalize_index(i, len))
                .collect(),
            IndexExpr::Slice { start, stop, step } => slice_positions(*start, *stop, *step, len),
        }
    }
}

impl Default for Indexer {
    fn default() -> Self {
        Self::FULL
    }
}

fn normalize_index(index: isize, len: usize) -> Result<usize> {
    let len_i = len as isize;
    let resolved = if index < 0 { index + len_i } else { index };
    if resolved < 0 || resolved >= len_i {
        return Err(VectorError::InvalidIndex(format!(
            "index {index} is out of bounds for axis with size {len}"
        )));
    }
    Ok(resolved as usize)
}

/// Python slice semantics: out-of-range bounds clamp, negative bounds count
/// from the end, and a zero step is rejected.
fn slice_positions(
    start: Option<isize>,
    stop: Option<isize>,
    step: Option<isize>,
    len: usize,
) -> Result<Vec<usize>> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(VectorError::InvalidIndex(
            "slice step cannot be zero".to_string(),
        ));
    }
    let len = len as isize;

    let mut out = Vec::new();
    if step > 0 {
        let clamp = |v: isize| {
            if v < 0 {
                (v + len).max(0)
            } else {
                v.min(len)
            }
        };
        let start = start.map_or(0, clamp);
        let stop = stop.map_or(len, clamp);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let clamp = |v: isize| {
            if v < 0 {
                (v + len).max(-1)
            } else {
                v.min(len - 1)
            }
        };
        let start = start.map_or(len - 1, clamp);
        let stop = stop.map_or(-1, clamp);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    Ok(out)
}
