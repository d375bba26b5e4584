//! Affine scaling between physical and normalized values.
//!
//! `physical = scaler * normalized + adder`, stored per element so whole-vector
//! conversions are a single pass over the buffer. Tables are indexed by
//! position in the root buffer and shared by every vector aliasing it.

use serde::{Deserialize, Serialize};

/// Scale factors declared for one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScaleFactors {
    pub scaler: f64,
    #[serde(default)]
    pub adder: f64,
}

impl Default for ScaleFactors {
    fn default() -> Self {
        Self {
            scaler: 1.0,
            adder: 0.0,
        }
    }
}

impl ScaleFactors {
    pub fn new(scaler: f64, adder: f64) -> Self {
        Self { scaler, adder }
    }

    pub fn scaler_only(scaler: f64) -> Self {
        Self { scaler, adder: 0.0 }
    }

    /// Factors mapping `ref0` to 0 and `ref_` to 1 in normalized units.
    pub fn from_refs(ref0: f64, ref_: f64) -> Self {
        Self {
            scaler: ref_ - ref0,
            adder: ref0,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.scaler == 1.0 && self.adder == 0.0
    }

    pub fn has_adder(&self) -> bool {
        self.adder != 0.0
    }

    pub fn to_phys(&self, normalized: f64) -> f64 {
        self.scaler * normalized + self.adder
    }

    pub fn to_norm(&self, physical: f64) -> f64 {
        (physical - self.adder) / self.scaler
    }
}

/// How a table relates normalized values to physical ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhysMap {
    /// `phys = scaler * norm (+ adder)`.
    Affine { with_adder: bool },
    /// `phys = norm / scaler`, used by linear vectors in reverse mode.
    Inverse,
}

/// Per-element scaler and optional adder arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingTable {
    scaler: Vec<f64>,
    adder: Option<Vec<f64>>,
}

impl ScalingTable {
    pub fn identity(len: usize, with_adder: bool) -> Self {
        Self {
            scaler: vec![1.0; len],
            adder: with_adder.then(|| vec![0.0; len]),
        }
    }

    pub fn len(&self) -> usize {
        self.scaler.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scaler.is_empty()
    }

    pub fn scaler(&self) -> &[f64] {
        &self.scaler
    }

    pub fn adder(&self) -> Option<&[f64]> {
        self.adder.as_deref()
    }

    /// Writes `factors` over `start..start + size`. The adder is dropped when
    /// the table carries none.
    pub fn set_factors(&mut self, start: usize, size: usize, factors: ScaleFactors) {
        self.scaler[start..start + size].fill(factors.scaler);
        if let Some(adder) = self.adder.as_mut() {
            adder[start..start + size].fill(factors.adder);
        }
    }

    /// Table holding the reciprocal of every scaler and no adder.
    pub(crate) fn reciprocal(&self) -> Self {
        Self {
            scaler: self.scaler.iter().map(|s| 1.0 / s).collect(),
            adder: None,
        }
    }

    fn adder_at(&self, pos: usize, map: PhysMap, real_part: bool) -> f64 {
        match (map, &self.adder) {
            (PhysMap::Affine { with_adder: true }, Some(adder)) if real_part => adder[pos],
            _ => 0.0,
        }
    }

    /// Normalized value at root position `pos` mapped to physical units.
    /// The adder only applies to the real plane.
    pub(crate) fn to_phys(&self, map: PhysMap, pos: usize, value: f64, real_part: bool) -> f64 {
        match map {
            PhysMap::Affine { .. } => {
                self.scaler[pos] * value + self.adder_at(pos, map, real_part)
            }
            PhysMap::Inverse => value / self.scaler[pos],
        }
    }

    pub(crate) fn to_norm(&self, map: PhysMap, pos: usize, value: f64, real_part: bool) -> f64 {
        match map {
            PhysMap::Affine { .. } => {
                (value - self.adder_at(pos, map, real_part)) / self.scaler[pos]
            }
            PhysMap::Inverse => value * self.scaler[pos],
        }
    }

    /// Converts `data`, which starts at root position `start`, in place.
    pub(crate) fn apply(
        &self,
        map: PhysMap,
        start: usize,
        data: &mut [f64],
        real_part: bool,
        to_norm: bool,
    ) {
        for (i, value) in data.iter_mut().enumerate() {
            let pos = start + i;
            *value = if to_norm {
                self.to_norm(map, pos, *value, real_part)
            } else {
                self.to_phys(map, pos, *value, real_part)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn refs_map_to_unit_interval() {
        let factors = ScaleFactors::from_refs(10.0, 30.0);
        assert!((factors.to_norm(10.0)).abs() < 1e-12);
        assert!((factors.to_norm(30.0) - 1.0).abs() < 1e-12);
        assert!(factors.has_adder());
        assert!(ScaleFactors::default().is_identity());
    }

    #[test]
    fn adder_is_skipped_for_imaginary_plane_and_when_disabled() {
        let mut table = ScalingTable::identity(2, true);
        table.set_factors(0, 2, ScaleFactors::new(2.0, 5.0));
        let with = PhysMap::Affine { with_adder: true };
        let without = PhysMap::Affine { with_adder: false };

        assert_eq!(table.to_phys(with, 0, 1.0, true), 7.0);
        assert_eq!(table.to_phys(with, 0, 1.0, false), 2.0);
        assert_eq!(table.to_phys(without, 1, 1.0, true), 2.0);
    }

    #[test]
    fn table_without_adder_ignores_declared_adder() {
        let mut table = ScalingTable::identity(3, false);
        table.set_factors(1, 2, ScaleFactors::new(4.0, 3.0));
        assert_eq!(table.scaler(), &[1.0, 4.0, 4.0]);
        assert!(table.adder().is_none());
        let map = PhysMap::Affine { with_adder: true };
        assert_eq!(table.to_phys(map, 2, 1.0, true), 4.0);
    }

    #[test]
    fn reciprocal_table_inverts_scalers() {
        let mut table = ScalingTable::identity(2, true);
        table.set_factors(0, 2, ScaleFactors::new(4.0, 1.0));
        let inv = table.reciprocal();
        assert_eq!(inv.scaler(), &[0.25, 0.25]);
        assert!(inv.adder().is_none());
    }

    proptest! {
        #[test]
        fn phys_norm_phys_is_identity(
            value in -1e6f64..1e6,
            scaler in prop_oneof![-1e3f64..-1e-3, 1e-3f64..1e3],
            adder in prop_oneof![Just(0.0f64), -1e3f64..1e3],
        ) {
            let mut table = ScalingTable::identity(1, true);
            table.set_factors(0, 1, ScaleFactors::new(scaler, adder));
            for map in [PhysMap::Affine { with_adder: true }, PhysMap::Inverse] {
                let norm = table.to_norm(map, 0, value, true);
                let back = table.to_phys(map, 0, norm, true);
                prop_assert!((back - value).abs() <= 1e-9 * value.abs().max(1.0));
            }
        }
    }
}
