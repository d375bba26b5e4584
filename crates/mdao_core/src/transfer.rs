//! Data movement between output and input vectors.
//!
//! Forward transfers copy connected output entries into inputs. Reverse
//! transfers accumulate input derivatives back into the outputs that feed them.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, VectorError};
use crate::value::{Tensor, Value};
use crate::vector::{ScaleDirection, Vector};

/// Moves values between a source (output) and target (input) vector.
pub trait Transfer {
    fn transfer(
        &self,
        src: &mut Vector<'_>,
        tgt: &mut Vector<'_>,
        mode: ScaleDirection,
    ) -> Result<()>;
}

/// One connection from an output to an input, by absolute name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub src: String,
    pub tgt: String,
    /// Flat source positions feeding the target, in target order. `None`
    /// connects the whole source.
    #[serde(default)]
    pub src_indices: Option<Vec<usize>>,
}

/// Single-process transfer over a list of connections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DenseTransfer {
    connections: Vec<Connection>,
}

impl DenseTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(mut self, src: &str, tgt: &str) -> Self {
        self.connections.push(Connection {
            src: src.to_string(),
            tgt: tgt.to_string(),
            src_indices: None,
        });
        self
    }

    pub fn connect_indexed(mut self, src: &str, tgt: &str, src_indices: Vec<usize>) -> Self {
        self.connections.push(Connection {
            src: src.to_string(),
            tgt: tgt.to_string(),
            src_indices: Some(src_indices),
        });
        self
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }
}

fn planes(value: &Value) -> (Vec<f64>, Vec<f64>) {
    (value.real().into_vec(), value.imag().into_vec())
}

fn join(re: Vec<f64>, im: Vec<f64>, complex: bool) -> Value {
    if complex {
        Value::Complex(Tensor::from_vec(
            re.into_iter()
                .zip(im)
                .map(|(r, i)| Complex64::new(r, i))
                .collect(),
        ))
    } else {
        Value::Real(Tensor::from_vec(re))
    }
}

fn check_positions(conn: &Connection, indices: &[usize], src_len: usize) -> Result<()> {
    match indices.iter().find(|&&i| i >= src_len) {
        Some(bad) => Err(VectorError::InvalidIndex(format!(
            "source index {bad} out of range for '{}' of size {src_len} (connected to '{}')",
            conn.src, conn.tgt
        ))),
        None => Ok(()),
    }
}

fn check_sizes(conn: &Connection, expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(VectorError::SizeMismatch {
            context: format!("connection '{}' -> '{}'", conn.src, conn.tgt),
            what: "source selection".to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

impl DenseTransfer {
    fn forward(&self, conn: &Connection, src: &Vector<'_>, tgt: &mut Vector<'_>) -> Result<()> {
        let value = src.get_by_absolute(&conn.src, true)?;
        let target_len = tgt.get_by_absolute(&conn.tgt, true)?.len();
        let value = match &conn.src_indices {
            None => value,
            Some(indices) => {
                check_positions(conn, indices, value.len())?;
                let complex = value.is_complex();
                let (re, im) = planes(&value);
                join(
                    indices.iter().map(|&i| re[i]).collect(),
                    indices.iter().map(|&i| im[i]).collect(),
                    complex,
                )
            }
        };
        check_sizes(conn, target_len, value.len())?;
        tgt.set_by_absolute(&conn.tgt, value, true)
    }

    fn reverse(&self, conn: &Connection, src: &mut Vector<'_>, tgt: &Vector<'_>) -> Result<()> {
        let incoming = tgt.get_by_absolute(&conn.tgt, true)?;
        let current = src.get_by_absolute(&conn.src, true)?;
        let complex = current.is_complex() || incoming.is_complex();
        let (mut re, mut im) = planes(&current);
        let (in_re, in_im) = planes(&incoming);

        match &conn.src_indices {
            None => {
                check_sizes(conn, in_re.len(), re.len())?;
                for k in 0..re.len() {
                    re[k] += in_re[k];
                    im[k] += in_im[k];
                }
            }
            Some(indices) => {
                check_positions(conn, indices, re.len())?;
                check_sizes(conn, in_re.len(), indices.len())?;
                for (k, &i) in indices.iter().enumerate() {
                    re[i] += in_re[k];
                    im[i] += in_im[k];
                }
            }
        }
        src.set_by_absolute(&conn.src, join(re, im, complex), true)
    }
}

impl Transfer for DenseTransfer {
    /// Forward copies `src` entries into `tgt`; reverse adds `tgt` entries
    /// into `src`. Values move as stored, without scaling.
    fn transfer(
        &self,
        src: &mut Vector<'_>,
        tgt: &mut Vector<'_>,
        mode: ScaleDirection,
    ) -> Result<()> {
        for conn in &self.connections {
            match mode {
                ScaleDirection::Fwd => self.forward(conn, src, tgt)?,
                ScaleDirection::Rev => self.reverse(conn, src, tgt)?,
            }
        }
        trace!(connections = self.connections.len(), ?mode, "transferred");
        Ok(())
    }
}
