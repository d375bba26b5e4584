//! Conversion between physical and normalized storage.

use std::cell::{Ref, RefCell};
use std::ops::Range;
use std::rc::{Rc, Weak};

use tracing::trace;

use super::alloc::Allocation;
use super::{ScaleDirection, SharedTable, Vector, VectorData, VectorKind, VectorName};
use crate::error::{Result, VectorError};
use crate::scaling::{PhysMap, ScaleFactors, ScalingTable};
use crate::system::System;

type Tables = (Option<SharedTable>, Option<Weak<RefCell<ScalingTable>>>);

/// A range of the root buffer holding normalized values.
#[derive(Debug, Clone)]
pub(crate) struct NormalizedRun {
    pub(crate) range: Range<usize>,
    pub(crate) table: SharedTable,
    pub(crate) map: PhysMap,
}

impl NormalizedRun {
    fn with_range(&self, range: Range<usize>) -> Self {
        Self {
            range,
            table: self.table.clone(),
            map: self.map,
        }
    }

    /// What is left of this run once `cut` is removed from it.
    fn without(self, cut: &Range<usize>) -> Vec<Self> {
        if self.range.end <= cut.start || self.range.start >= cut.end {
            return vec![self];
        }
        let mut parts = Vec::with_capacity(2);
        if self.range.start < cut.start {
            parts.push(self.with_range(self.range.start..cut.start));
        }
        if self.range.end > cut.end {
            parts.push(self.with_range(cut.end..self.range.end));
        }
        parts
    }
}

impl VectorData {
    /// Normalized runs overlapping `range`, clipped to it.
    pub(crate) fn runs_within(&self, range: &Range<usize>) -> Vec<NormalizedRun> {
        self.normalized
            .iter()
            .filter_map(|run| {
                let start = run.range.start.max(range.start);
                let end = run.range.end.min(range.end);
                (start < end).then(|| run.with_range(start..end))
            })
            .collect()
    }

    /// Sub-ranges of `range` not covered by any normalized run.
    fn uncovered(&self, range: &Range<usize>) -> Vec<Range<usize>> {
        let mut covered: Vec<_> = self.runs_within(range).into_iter().map(|r| r.range).collect();
        covered.sort_by_key(|r| r.start);
        let mut gaps = Vec::new();
        let mut cursor = range.start;
        for run in covered {
            if run.start > cursor {
                gaps.push(cursor..run.start);
            }
            cursor = cursor.max(run.end);
        }
        if cursor < range.end {
            gaps.push(cursor..range.end);
        }
        gaps
    }
}

fn build_table(
    system: &System,
    kind: VectorKind,
    with_adder: bool,
    allocation: &Allocation,
) -> ScalingTable {
    let mut table = ScalingTable::identity(allocation.root_len, with_adder);
    for meta in system.variables(kind.io_type()) {
        if let Some(view) = allocation.views.get(&meta.abs_name) {
            table.set_factors(
                allocation.root_offset + view.start,
                view.size(),
                meta.factors_for(kind),
            );
        }
    }
    table
}

/// Picks or builds the scaling tables of a new vector.
///
/// A vector under a root of the same name and kind reuses the root's tables.
/// Linear vectors share the nonlinear table, except linear inputs of a node
/// with output scaling: they own a reciprocal table and keep a weak handle on
/// the nonlinear one so later factor changes are seen in forward mode.
#[allow(clippy::too_many_arguments)]
pub(super) fn scaling_tables(
    system: &System,
    name: VectorName,
    kind: VectorKind,
    do_adder: bool,
    has_solver_ref: bool,
    allocation: &Allocation,
    root: Option<&Vector<'_>>,
    nonlinear: Option<&Vector<'_>>,
    context: &str,
) -> Result<Tables> {
    if let Some(root) = root {
        if root.scaling.is_some() && root.name == name && root.kind == kind {
            return Ok((root.scaling.clone(), root.scaling_nl_vec.clone()));
        }
    }

    if name == VectorName::Nonlinear {
        let table = build_table(system, kind, do_adder, allocation);
        return Ok((Some(Rc::new(RefCell::new(table))), None));
    }

    let nl_table = match nonlinear {
        Some(nl) => {
            if nl.name != VectorName::Nonlinear || nl.kind != kind {
                return Err(VectorError::LayoutMismatch {
                    context: context.to_string(),
                    reason: format!(
                        "scale factors must come from a nonlinear {} vector, got a {} {} vector",
                        kind, nl.name, nl.kind
                    ),
                });
            }
            let expected = allocation.root_len;
            let actual = nl.root_len;
            if expected != actual {
                return Err(VectorError::SizeMismatch {
                    context: context.to_string(),
                    what: "nonlinear root buffer".to_string(),
                    expected,
                    actual,
                });
            }
            nl.scaling.clone()
        }
        None => None,
    };

    if has_solver_ref {
        let own = match &nl_table {
            Some(table) => table.borrow().reciprocal(),
            None => build_table(system, kind, false, allocation).reciprocal(),
        };
        let weak = nl_table.as_ref().map(Rc::downgrade);
        Ok((Some(Rc::new(RefCell::new(own))), weak))
    } else {
        let table = nl_table
            .unwrap_or_else(|| Rc::new(RefCell::new(build_table(system, kind, false, allocation))));
        Ok((Some(table), None))
    }
}

impl Vector<'_> {
    /// The table and mapping used to convert values in `direction`.
    pub(super) fn active_table(
        &self,
        direction: ScaleDirection,
    ) -> Option<(SharedTable, PhysMap)> {
        let own = self.scaling.clone()?;
        let affine = PhysMap::Affine { with_adder: false };
        match (self.name, direction) {
            (VectorName::Nonlinear, _) => Some((
                own,
                PhysMap::Affine {
                    with_adder: self.do_adder,
                },
            )),
            (VectorName::Linear, ScaleDirection::Fwd) if self.has_solver_ref => {
                match self.scaling_nl_vec.as_ref().and_then(Weak::upgrade) {
                    Some(nl) => Some((nl, affine)),
                    // own table holds reciprocals
                    None => Some((own, PhysMap::Inverse)),
                }
            }
            (VectorName::Linear, ScaleDirection::Fwd) => Some((own, affine)),
            (VectorName::Linear, ScaleDirection::Rev) => Some((own, PhysMap::Inverse)),
        }
    }

    /// Converts the stored values to normalized units. Entries already
    /// normalized, through this vector or any alias of its buffer, are left
    /// alone; vectors without scaling do nothing.
    pub fn scale_to_norm(&mut self, direction: ScaleDirection) -> Result<()> {
        let Some((table, map)) = self.active_table(direction) else {
            return Ok(());
        };
        let range = self.range();
        let mut data = self.data_mut()?;
        let gaps = data.uncovered(&range);
        if gaps.is_empty() {
            return Ok(());
        }

        {
            let factors = table.borrow();
            let VectorData { real, imag, .. } = &mut *data;
            for gap in &gaps {
                factors.apply(map, gap.start, &mut real[gap.clone()], true, true);
                if let Some(imag) = imag.as_mut() {
                    factors.apply(map, gap.start, &mut imag[gap.clone()], false, true);
                }
            }
        }
        data.normalized.extend(gaps.into_iter().map(|range| NormalizedRun {
            range,
            table: table.clone(),
            map,
        }));
        trace!(
            system = self.system.pathname(),
            name = %self.name,
            kind = %self.kind,
            ?direction,
            "normalized vector"
        );
        Ok(())
    }

    /// Converts the normalized entries of this vector back to physical units,
    /// each with the conversion that normalized it.
    pub fn scale_to_phys(&mut self) -> Result<()> {
        let range = self.range();
        let mut data = self.data_mut()?;
        let overlaps = data.runs_within(&range);
        if overlaps.is_empty() {
            return Ok(());
        }

        let VectorData {
            real,
            imag,
            normalized,
        } = &mut *data;
        for run in &overlaps {
            let factors = run.table.borrow();
            let seg = run.range.clone();
            factors.apply(run.map, seg.start, &mut real[seg.clone()], true, false);
            if let Some(imag) = imag.as_mut() {
                factors.apply(run.map, seg.start, &mut imag[seg], false, false);
            }
        }
        let rest: Vec<_> = std::mem::take(normalized)
            .into_iter()
            .flat_map(|run| run.without(&range))
            .collect();
        *normalized = rest;
        trace!(
            system = self.system.pathname(),
            name = %self.name,
            kind = %self.kind,
            "restored physical values"
        );
        Ok(())
    }

    /// True while any entry of this vector holds a normalized value.
    pub fn is_normalized(&self) -> Result<bool> {
        let range = self.range();
        Ok(!self.data()?.runs_within(&range).is_empty())
    }

    pub fn scaling_table(&self) -> Option<Ref<'_, ScalingTable>> {
        self.scaling.as_ref().map(|table| table.borrow())
    }

    /// Replaces the factors of one variable in this vector's table. Every
    /// vector sharing the table sees the change; stored values are not
    /// converted.
    pub fn set_scale_factors(&mut self, name: &str, factors: ScaleFactors) -> Result<()> {
        let abs_name = self
            .resolve(name)
            .ok_or_else(|| VectorError::not_found(self.context(), name))?;
        let view = self.view(&abs_name, name)?;
        let Some(table) = self.scaling.as_ref() else {
            return Err(VectorError::LayoutMismatch {
                context: self.context(),
                reason: format!("cannot set scale factors of '{name}' on an unscaled vector"),
            });
        };

        let factors = if self.has_solver_ref {
            ScaleFactors::scaler_only(1.0 / factors.scaler)
        } else {
            factors
        };
        table
            .try_borrow_mut()
            .map_err(|_| VectorError::BufferBorrowed {
                context: self.context(),
            })?
            .set_factors(self.root_offset + view.start, view.size(), factors);
        Ok(())
    }
}
