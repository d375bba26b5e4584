//! Named, shaped storage for the variables of one hierarchy level.
//!
//! A root vector owns a contiguous buffer (a real plane and, when complex step
//! is enabled, an imaginary plane). Every other vector of the hierarchy aliases
//! a sub-range of that buffer, so a write through any of them is immediately
//! visible through all the others.
//!
//! Named access (`get`/`set`) resolves relative and promoted names, honours the
//! relevance set, the read-only flag and the complex-step mode, and speaks
//! physical units even while the buffer holds normalized values. Absolute
//! access (`get_by_absolute`/`set_by_absolute`) skips all of that and is meant
//! for kernels and transfers that validated their names up front.

mod alloc;
mod normalize;
mod ops;
mod types;

pub(crate) use normalize::NormalizedRun;
pub use types::{HashAlgorithm, IoType, ScaleDirection, VectorKind, VectorName, VectorSettings};

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;
use num_complex::Complex64;
use tracing::{debug, trace};

use crate::backend::DenseBackend;
use crate::error::{Result, VectorError};
use crate::indexer::Indexer;
use crate::name_maps::abs_name2rel_name;
use crate::scaling::ScalingTable;
use crate::system::System;
use crate::traits::VectorBackend;
use crate::value::{Shape, Tensor, TensorView, TensorViewMut, Value};

/// The buffer owned by a root vector.
#[derive(Debug, Default)]
pub(crate) struct VectorData {
    pub(crate) real: Vec<f64>,
    pub(crate) imag: Option<Vec<f64>>,
    /// Root ranges currently holding normalized values, with the conversion
    /// that produced them. Kept with the buffer so every alias agrees on
    /// which entries are normalized.
    pub(crate) normalized: Vec<NormalizedRun>,
}

pub(crate) type SharedData = Rc<RefCell<VectorData>>;
pub(crate) type SharedTable = Rc<RefCell<ScalingTable>>;

/// Location of one variable, relative to the start of its vector.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VarView {
    pub(crate) start: usize,
    pub(crate) shape: Shape,
}

impl VarView {
    pub(crate) fn size(&self) -> usize {
        self.shape.size()
    }

    pub(crate) fn range(&self) -> Range<usize> {
        self.start..self.start + self.size()
    }
}

#[derive(Debug)]
pub struct Vector<'s> {
    name: VectorName,
    kind: VectorKind,
    system: &'s System,
    settings: VectorSettings,
    backend: Rc<dyn VectorBackend>,
    data: SharedData,
    root_offset: usize,
    is_root: bool,
    len: usize,
    /// Length of the root buffer.
    root_len: usize,
    complex: bool,
    views: IndexMap<String, VarView>,
    /// `None` while every variable is relevant.
    relevant: Option<HashSet<String>>,
    under_complex_step: bool,
    read_only: bool,
    do_scaling: bool,
    do_adder: bool,
    has_solver_ref: bool,
    scaling: Option<SharedTable>,
    scaling_nl_vec: Option<Weak<RefCell<ScalingTable>>>,
}

/// Construction parameters for a [`Vector`].
///
/// Without a root the vector allocates and becomes the root of its hierarchy
/// level; with one it aliases the root's buffer. Linear vectors take their
/// scale factors from the nonlinear vector of the same kind.
pub struct VectorBuilder<'s, 'r> {
    system: &'s System,
    name: VectorName,
    kind: VectorKind,
    root: Option<&'r Vector<'r>>,
    nonlinear: Option<&'r Vector<'r>>,
    settings: VectorSettings,
    backend: Option<Rc<dyn VectorBackend>>,
}

impl<'s, 'r> VectorBuilder<'s, 'r> {
    pub fn root(mut self, root: &'r Vector<'r>) -> Self {
        self.root = Some(root);
        self
    }

    pub fn nonlinear(mut self, nonlinear: &'r Vector<'r>) -> Self {
        self.nonlinear = Some(nonlinear);
        self
    }

    pub fn settings(mut self, settings: VectorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn backend(mut self, backend: Rc<dyn VectorBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn build(self) -> Result<Vector<'s>> {
        let Self {
            system,
            name,
            kind,
            root,
            nonlinear,
            settings,
            backend,
        } = self;

        let io = kind.io_type();
        let flags = system.scaling_flags();
        let do_scaling = flags.do_scaling(kind);
        let do_adder = flags.do_adder(kind);
        let has_solver_ref =
            flags.has_output_scaling && kind == VectorKind::Input && name == VectorName::Linear;

        let context = format!("{} ({} {} vector)", system.msginfo(), name, kind);
        let allocation = match root {
            None => alloc::allocate_root(system, io, settings.alloc_complex),
            Some(root) => {
                alloc::allocate_child(system, io, root, settings.alloc_complex, &context)?
            }
        };
        let backend = backend
            .or_else(|| root.map(|r| r.backend.clone()))
            .unwrap_or_else(|| Rc::new(DenseBackend));

        let (scaling, scaling_nl_vec) = if do_scaling {
            normalize::scaling_tables(
                system,
                name,
                kind,
                do_adder,
                has_solver_ref,
                &allocation,
                root,
                nonlinear,
                &context,
            )?
        } else {
            (None, None)
        };

        debug!(
            system = system.pathname(),
            name = %name,
            kind = %kind,
            len = allocation.len,
            root_offset = allocation.root_offset,
            complex = allocation.complex,
            do_scaling,
            "allocated vector"
        );

        Ok(Vector {
            name,
            kind,
            system,
            settings,
            backend,
            data: allocation.data,
            root_offset: allocation.root_offset,
            is_root: allocation.is_root,
            len: allocation.len,
            root_len: allocation.root_len,
            complex: allocation.complex,
            views: allocation.views,
            relevant: None,
            under_complex_step: false,
            read_only: settings.read_only,
            do_scaling,
            do_adder,
            has_solver_ref,
            scaling,
            scaling_nl_vec,
        })
    }
}

impl<'s> Vector<'s> {
    pub fn builder<'r>(
        system: &'s System,
        name: VectorName,
        kind: VectorKind,
    ) -> VectorBuilder<'s, 'r> {
        VectorBuilder {
            system,
            name,
            kind,
            root: None,
            nonlinear: None,
            settings: VectorSettings::default(),
            backend: None,
        }
    }

    /// A root vector with default settings.
    pub fn new(system: &'s System, name: VectorName, kind: VectorKind) -> Result<Self> {
        Self::builder(system, name, kind).build()
    }

    pub fn name(&self) -> VectorName {
        self.name
    }

    pub fn kind(&self) -> VectorKind {
        self.kind
    }

    pub fn io_type(&self) -> IoType {
        self.kind.io_type()
    }

    pub fn system(&self) -> &'s System {
        self.system
    }

    pub fn settings(&self) -> &VectorSettings {
        &self.settings
    }

    pub fn backend(&self) -> &dyn VectorBackend {
        self.backend.as_ref()
    }

    /// Total flattened length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn nvars(&self) -> usize {
        self.views.len()
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Position of this vector's first element in the root buffer.
    pub fn root_offset(&self) -> usize {
        self.root_offset
    }

    /// True when both vectors alias the same root buffer.
    pub fn shares_root_with(&self, other: &Vector<'_>) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Whether imaginary storage was allocated.
    pub fn is_complex(&self) -> bool {
        self.complex
    }

    pub fn under_complex_step(&self) -> bool {
        self.under_complex_step
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    pub fn do_scaling(&self) -> bool {
        self.do_scaling
    }

    pub fn do_adder(&self) -> bool {
        self.do_adder
    }

    pub fn has_solver_ref(&self) -> bool {
        self.has_solver_ref
    }

    fn context(&self) -> String {
        format!("{} ({} {} vector)", self.system.msginfo(), self.name, self.kind)
    }

    fn range(&self) -> Range<usize> {
        self.root_offset..self.root_offset + self.len
    }

    /// Shared access to the root buffer. Fails while a mutable view of it is
    /// alive through any alias.
    fn data(&self) -> Result<Ref<'_, VectorData>> {
        self.data.try_borrow().map_err(|_| VectorError::BufferBorrowed {
            context: self.context(),
        })
    }

    fn data_mut(&self) -> Result<RefMut<'_, VectorData>> {
        self.data.try_borrow_mut().map_err(|_| VectorError::BufferBorrowed {
            context: self.context(),
        })
    }

    fn is_relevant(&self, abs_name: &str) -> bool {
        self.relevant
            .as_ref()
            .map_or(true, |names| names.contains(abs_name))
    }

    fn resolve(&self, name: &str) -> Option<String> {
        self.system.resolver().resolve(self.io_type(), name, |abs| {
            self.views.contains_key(abs) && self.is_relevant(abs)
        })
    }

    fn view(&self, abs_name: &str, display: &str) -> Result<&VarView> {
        self.views
            .get(abs_name)
            .ok_or_else(|| VectorError::not_found(self.context(), display))
    }

    /// True if `name` resolves to a relevant variable of this vector.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn contains_abs(&self, abs_name: &str) -> bool {
        self.views.contains_key(abs_name) && self.is_relevant(abs_name)
    }

    // --- Named access ---

    /// Value of a variable in physical units.
    pub fn get(&self, name: &str) -> Result<Value> {
        let abs_name = self
            .resolve(name)
            .ok_or_else(|| VectorError::not_found(self.context(), name))?;
        let view = self.view(&abs_name, name)?;
        Ok(self.read_var(&*self.data()?, view, false, true))
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.set_var(name, value, &Indexer::FULL, None)
    }

    /// Writes `value` into the selection of a variable.
    ///
    /// `display_name` replaces `name` in error messages, for callers that
    /// address a variable through an alias the user does not know.
    pub fn set_var(
        &mut self,
        name: &str,
        value: impl Into<Value>,
        indexer: &Indexer,
        display_name: Option<&str>,
    ) -> Result<()> {
        let display = display_name.unwrap_or(name);
        let abs_name = self
            .resolve(name)
            .ok_or_else(|| VectorError::not_found(self.context(), display))?;
        if self.read_only {
            return Err(VectorError::ReadOnlyViolation {
                context: self.context(),
                name: display.to_string(),
                kind: self.kind.to_string(),
            });
        }

        let view = self.view(&abs_name, display)?;
        let value = value.into();
        if indexer.is_full() {
            let shape = if indexer.flat_src() {
                Shape::vector(view.size())
            } else {
                view.shape.clone()
            };
            self.write(display, view, None, &shape, &value, true)
        } else {
            let selection = indexer.resolve(&view.shape)?;
            self.write(
                display,
                view,
                Some(selection.flat.as_slice()),
                &selection.shape,
                &value,
                true,
            )
        }
    }

    // --- Absolute access ---

    /// Stored value of a variable, without name resolution or scaling.
    pub fn get_by_absolute(&self, abs_name: &str, flat: bool) -> Result<Value> {
        let view = self.view(abs_name, abs_name)?;
        Ok(self.read_var(&*self.data()?, view, flat, false))
    }

    /// Stores a value without name resolution, scaling or read-only checks.
    pub fn set_by_absolute(
        &mut self,
        abs_name: &str,
        value: impl Into<Value>,
        flat: bool,
    ) -> Result<()> {
        let view = self.view(abs_name, abs_name)?;
        let shape = if flat {
            Shape::vector(view.size())
        } else {
            view.shape.clone()
        };
        self.write(abs_name, view, None, &shape, &value.into(), false)
    }

    /// Zero-copy window onto a variable's real plane.
    pub fn flat_view(&self, abs_name: &str) -> Result<Ref<'_, [f64]>> {
        let view = self.view(abs_name, abs_name)?;
        let start = self.root_offset + view.start;
        let range = start..start + view.size();
        Ok(Ref::map(self.data()?, move |d| &d.real[range]))
    }

    // --- Iteration ---

    /// `(name, value)` for every relevant variable, in declaration order.
    ///
    /// The iterator holds a shared borrow of the buffer until it is dropped.
    pub fn iter(
        &self,
        relative_names: bool,
    ) -> Result<impl Iterator<Item = (String, Value)> + '_> {
        let data = self.data()?;
        let path = self.system.pathname();
        Ok(self
            .views
            .iter()
            .filter(move |(name, _)| self.is_relevant(name))
            .map(move |(name, view)| {
                let key = if relative_names {
                    abs_name2rel_name(path, name).to_string()
                } else {
                    name.clone()
                };
                (key, self.read_var(&data, view, false, true))
            }))
    }

    /// Relative names of the relevant variables.
    pub fn keys(&self) -> impl Iterator<Item = &str> + '_ {
        let path = self.system.pathname();
        self.views
            .keys()
            .filter(move |name| self.is_relevant(name))
            .map(move |name| abs_name2rel_name(path, name))
    }

    /// One value per declared variable; variables outside the relevance set
    /// read as zeros of their shape.
    pub fn values(&self) -> Result<impl Iterator<Item = Value> + '_> {
        let data = self.data()?;
        Ok(self.views.iter().map(move |(name, view)| {
            if self.is_relevant(name) {
                self.read_var(&data, view, false, true)
            } else {
                Value::zeros(view.shape.clone(), self.under_complex_step)
            }
        }))
    }

    /// Every absolute name, relevant or not.
    pub fn abs_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.views.keys().map(String::as_str)
    }

    /// Stored `(absolute name, value)` pairs for every variable.
    pub fn abs_items(&self, flat: bool) -> Result<impl Iterator<Item = (&str, Value)> + '_> {
        let data = self.data()?;
        Ok(self
            .views
            .iter()
            .map(move |(name, view)| (name.as_str(), self.read_var(&data, view, flat, false))))
    }

    /// Snapshot of every stored value.
    pub fn copy_vars(&self) -> Result<IndexMap<String, Value>> {
        Ok(self
            .abs_items(false)?
            .map(|(name, value)| (name.to_string(), value))
            .collect())
    }

    // --- Bulk writes ---

    /// Fills the buffer with one value per variable, in declaration order.
    pub fn set_all<V: Into<Value>>(&mut self, values: impl IntoIterator<Item = V>) -> Result<()> {
        let what = format!("{} {} vector", self.name, self.kind);
        if self.read_only {
            return Err(VectorError::ReadOnlyViolation {
                context: self.context(),
                name: what,
                kind: self.kind.to_string(),
            });
        }

        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        let total: usize = values.iter().map(Value::len).sum();
        if total != self.len {
            return Err(VectorError::shape(
                self.context(),
                what,
                format!("values hold {total} entries but the vector has {}", self.len),
            ));
        }

        let mut re = Vec::with_capacity(total);
        let mut im = Vec::with_capacity(total);
        for value in &values {
            re.extend_from_slice(value.real().data());
            im.extend_from_slice(value.imag().data());
        }
        let whole = VarView {
            start: 0,
            shape: Shape::vector(self.len),
        };
        let value = Value::Complex(Tensor::from_vec(
            re.into_iter()
                .zip(im)
                .map(|(r, i)| Complex64::new(r, i))
                .collect(),
        ));
        self.write(&what, &whole, None, &whole.shape, &value, false)
    }

    /// Sets every element to `value`, bypassing scaling.
    pub fn set_scalar(&mut self, value: f64) -> Result<()> {
        let range = self.range();
        let mut data = self.data_mut()?;
        data.real[range.clone()].fill(value);
        if self.under_complex_step {
            if let Some(imag) = data.imag.as_mut() {
                imag[range].fill(0.0);
            }
        }
        Ok(())
    }

    /// Writes into the flat buffer at the positions selected by `indexer`,
    /// bypassing scaling.
    pub fn set_val(&mut self, value: impl Into<Value>, indexer: &Indexer) -> Result<()> {
        let whole = VarView {
            start: 0,
            shape: Shape::vector(self.len),
        };
        let what = format!("{} {} vector", self.name, self.kind);
        let value = value.into();
        if indexer.is_full() {
            self.write(&what, &whole, None, &whole.shape, &value, false)
        } else {
            let selection = indexer.resolve(&whole.shape)?;
            let positions = Some(selection.flat.as_slice());
            self.write(&what, &whole, positions, &selection.shape, &value, false)
        }
    }

    /// Copies the whole buffer of `other`, bypassing scaling.
    pub fn set_from_vector(&mut self, other: &Vector<'_>) -> Result<()> {
        if other.len != self.len {
            return Err(VectorError::SizeMismatch {
                context: self.context(),
                what: format!("source {} {} vector", other.name, other.kind),
                expected: self.len,
                actual: other.len,
            });
        }
        let (re, im) = {
            let src = other.data()?;
            let range = other.range();
            let im = if other.under_complex_step {
                src.imag.as_ref().map(|v| v[range.clone()].to_vec())
            } else {
                None
            };
            (src.real[range].to_vec(), im)
        };

        let range = self.range();
        let mut dst = self.data_mut()?;
        dst.real[range.clone()].copy_from_slice(&re);
        if self.under_complex_step {
            if let Some(imag) = dst.imag.as_mut() {
                match im {
                    Some(im) => imag[range].copy_from_slice(&im),
                    None => imag[range].fill(0.0),
                }
            }
        }
        Ok(())
    }

    // --- Flat buffer ---

    /// The real plane of this vector, without copying.
    ///
    /// While the guard is alive, writes through any vector aliasing the same
    /// buffer fail with [`VectorError::BufferBorrowed`].
    pub fn as_flat_array(&self) -> Result<Ref<'_, [f64]>> {
        let range = self.range();
        Ok(Ref::map(self.data()?, move |d| &d.real[range]))
    }

    /// Mutable real plane for numeric kernels. Not subject to `read_only`.
    pub fn as_flat_array_mut(&mut self) -> Result<RefMut<'_, [f64]>> {
        let range = self.range();
        Ok(RefMut::map(self.data_mut()?, move |d| &mut d.real[range]))
    }

    /// The imaginary plane, when one was allocated.
    pub fn imag_flat_array(&self) -> Result<Option<Ref<'_, [f64]>>> {
        let range = self.range();
        let data = self.data()?;
        Ok(Ref::filter_map(data, move |d| d.imag.as_deref().map(|imag| &imag[range])).ok())
    }

    /// Owned copy of the real plane, produced by the backend.
    pub fn to_flat_vec(&self) -> Result<Vec<f64>> {
        self.backend.copy_flat(&self.as_flat_array()?)
    }

    /// Shaped views of this vector's own stored values, keyed by relative
    /// name. Values are read as stored, normalized or not.
    pub fn own_views(&self) -> Result<OwnViews<'_>> {
        let path = self.system.pathname();
        let layout = self
            .views
            .iter()
            .map(|(name, view)| (abs_name2rel_name(path, name).to_string(), view.clone()))
            .collect();
        Ok(OwnViews {
            data: self.as_flat_array()?,
            layout,
        })
    }

    /// Shaped views into `buffer` keyed by relative name, using this vector's
    /// layout.
    pub fn local_views<'b>(
        &self,
        buffer: &'b [f64],
    ) -> Result<IndexMap<String, TensorView<'b>>> {
        self.check_local_buffer(buffer.len())?;
        let path = self.system.pathname();
        Ok(self
            .views
            .iter()
            .map(|(name, view)| {
                let rel = abs_name2rel_name(path, name).to_string();
                (rel, TensorView::new(view.shape.clone(), &buffer[view.range()]))
            })
            .collect())
    }

    pub fn local_views_mut<'b>(
        &self,
        buffer: &'b mut [f64],
    ) -> Result<IndexMap<String, TensorViewMut<'b>>> {
        self.check_local_buffer(buffer.len())?;
        let path = self.system.pathname();
        let mut rest = buffer;
        let mut out = IndexMap::with_capacity(self.views.len());
        for (name, view) in &self.views {
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(view.size());
            rest = tail;
            let rel = abs_name2rel_name(path, name).to_string();
            out.insert(rel, TensorViewMut::new(view.shape.clone(), head));
        }
        Ok(out)
    }

    fn check_local_buffer(&self, actual: usize) -> Result<()> {
        if actual != self.len {
            return Err(VectorError::SizeMismatch {
                context: self.context(),
                what: "local view buffer".to_string(),
                expected: self.len,
                actual,
            });
        }
        Ok(())
    }

    // --- Modes ---

    /// Switches named reads and writes between the real plane and both
    /// planes. Calling it with the current state does nothing.
    pub fn set_complex_step_mode(&mut self, active: bool) -> Result<()> {
        if active == self.under_complex_step {
            return Ok(());
        }
        if active && !self.is_complex() {
            return Err(VectorError::ComplexStepUnavailable {
                context: self.context(),
                kind: self.kind.to_string(),
            });
        }
        self.under_complex_step = active;
        trace!(system = self.system.pathname(), kind = %self.kind, active, "complex step mode");
        Ok(())
    }

    /// Restricts iteration, named access and reductions to `names`
    /// (absolute). Storage is untouched.
    pub fn set_relevant<I, S>(&mut self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = HashSet::new();
        for name in names {
            let name = name.as_ref();
            if !self.views.contains_key(name) {
                return Err(VectorError::not_found(self.context(), name));
            }
            set.insert(name.to_string());
        }
        trace!(system = self.system.pathname(), relevant = set.len(), "relevance restricted");
        self.relevant = Some(set);
        Ok(())
    }

    pub fn reset_relevance(&mut self) {
        self.relevant = None;
    }

    pub fn in_matvec_context(&self) -> bool {
        self.relevant.is_some()
    }

    /// Runs `f` with the relevance set restricted to `names`, restoring the
    /// previous set afterwards.
    pub fn matvec_context<I, S, R>(
        &mut self,
        names: I,
        f: impl FnOnce(&mut Self) -> R,
    ) -> Result<R>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let previous = self.relevant.take();
        if let Err(err) = self.set_relevant(names) {
            self.relevant = previous;
            return Err(err);
        }
        let result = f(self);
        self.relevant = previous;
        Ok(result)
    }

    // --- Buffer plumbing ---

    /// Reads a variable from `data`. With `physical`, entries of normalized
    /// runs are mapped back to physical units.
    fn read_var(&self, data: &VectorData, view: &VarView, flat: bool, physical: bool) -> Value {
        let start = self.root_offset + view.start;
        let range = start..start + view.size();
        let shape = if flat {
            Shape::vector(view.size())
        } else {
            view.shape.clone()
        };

        let mut re = data.real[range.clone()].to_vec();
        let mut im = if self.under_complex_step {
            data.imag.as_ref().map(|v| v[range.clone()].to_vec())
        } else {
            None
        };

        if physical {
            for run in data.runs_within(&range) {
                // tables are only borrowed mutably inside `set_scale_factors`
                let table = run.table.borrow();
                let local = run.range.start - start..run.range.end - start;
                table.apply(run.map, run.range.start, &mut re[local.clone()], true, false);
                if let Some(im) = im.as_mut() {
                    table.apply(run.map, run.range.start, &mut im[local], false, false);
                }
            }
        }

        match im {
            Some(im) => Value::Complex(
                Tensor::from_vec(
                    re.into_iter()
                        .zip(im)
                        .map(|(r, i)| Complex64::new(r, i))
                        .collect(),
                )
                .reshaped(shape),
            ),
            None => Value::Real(Tensor::from_vec(re).reshaped(shape)),
        }
    }

    /// Writes `value` into `view` at `positions` (the whole view when `None`).
    ///
    /// A value with as many elements as the selection is reshaped; any other
    /// value is broadcast onto `target` with right-aligned dimensions, each
    /// equal or 1. Outside complex step only the real part is stored.
    fn write(
        &self,
        display: &str,
        view: &VarView,
        positions: Option<&[usize]>,
        target: &Shape,
        value: &Value,
        physical: bool,
    ) -> Result<()> {
        let count = positions.map_or(view.size(), <[usize]>::len);
        let sources = if value.len() == count {
            None
        } else {
            match value.shape().broadcast_positions(target) {
                Some(sources) if sources.len() == count => Some(sources),
                _ => {
                    return Err(VectorError::shape(
                        self.context(),
                        display,
                        format!(
                            "could not broadcast input array from shape {} into shape {}",
                            value.shape(),
                            target
                        ),
                    ))
                }
            }
        };

        let (re, im) = match value {
            Value::Real(t) => (t.data().to_vec(), None),
            Value::Complex(t) => (
                t.data().iter().map(|z| z.re).collect::<Vec<_>>(),
                Some(t.data().iter().map(|z| z.im).collect::<Vec<_>>()),
            ),
        };

        let start = self.root_offset + view.start;
        let mut data = self.data_mut()?;
        let runs = if physical {
            data.runs_within(&(start..start + view.size()))
        } else {
            Vec::new()
        };
        let tables: Vec<_> = runs.iter().map(|run| run.table.borrow()).collect();
        let VectorData { real, imag, .. } = &mut *data;
        let mut imag = if self.under_complex_step {
            imag.as_mut()
        } else {
            None
        };

        for k in 0..count {
            let src = sources.as_ref().map_or(k, |s| s[k]);
            let pos = start + positions.map_or(k, |p| p[k]);
            let scaling = runs
                .iter()
                .position(|run| run.range.contains(&pos))
                .map(|i| (&tables[i], runs[i].map));

            let mut r = re[src];
            if let Some((table, map)) = scaling {
                r = table.to_norm(map, pos, r, true);
            }
            real[pos] = r;

            if let Some(imag) = imag.as_mut() {
                let mut i = im.as_ref().map_or(0.0, |v| v[src]);
                if let Some((table, map)) = scaling {
                    i = table.to_norm(map, pos, i, false);
                }
                imag[pos] = i;
            }
        }
        Ok(())
    }
}

/// Shaped read-only views of a vector's stored values, keyed by relative
/// name. Holds a shared borrow of the buffer.
pub struct OwnViews<'v> {
    data: Ref<'v, [f64]>,
    layout: IndexMap<String, VarView>,
}

impl OwnViews<'_> {
    pub fn get(&self, name: &str) -> Option<TensorView<'_>> {
        self.layout
            .get(name)
            .map(|view| TensorView::new(view.shape.clone(), &self.data[view.range()]))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, TensorView<'_>)> + '_ {
        self.layout.iter().map(|(name, view)| {
            (
                name.as_str(),
                TensorView::new(view.shape.clone(), &self.data[view.range()]),
            )
        })
    }

    pub fn len(&self) -> usize {
        self.layout.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.is_empty()
    }
}

impl fmt::Display for Vector<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.data.try_borrow() {
            Ok(data) => write!(f, "{:?}", &data.real[self.range()]),
            Err(_) => f.write_str("<borrowed>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::System;
    use proptest::prelude::*;

    fn xy_system() -> System {
        System::builder("")
            .output("x", Shape::scalar())
            .output("y", Shape::vector(3))
            .build()
            .expect("valid system")
    }

    fn complex_settings() -> VectorSettings {
        VectorSettings {
            alloc_complex: true,
            ..VectorSettings::default()
        }
    }

    #[test]
    fn scalar_and_array_round_trip_through_flat_buffer() {
        let system = xy_system();
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");

        vec.set("x", 2.5).expect("set x");
        vec.set("y", [1.0, 2.0, 3.0]).expect("set y");

        assert_eq!(&*vec.as_flat_array().expect("flat"), &[2.5, 1.0, 2.0, 3.0]);
        let x = vec.get("x").expect("get x");
        assert!(x.is_scalar());
        assert_eq!(x, 2.5);
        assert_eq!(vec.get("y").expect("get y").real().data(), &[1.0, 2.0, 3.0]);
        assert_eq!(vec.to_string(), "[2.5, 1.0, 2.0, 3.0]");
    }

    #[test]
    fn complex_step_reads_follow_mode() {
        let system = xy_system();
        let mut vec = Vector::builder(&system, VectorName::Nonlinear, VectorKind::Output)
            .settings(complex_settings())
            .build()
            .expect("vector");

        vec.set("x", 3.0).expect("set real");
        vec.set_complex_step_mode(true).expect("enable");
        assert_eq!(
            vec.get("x").expect("get").as_complex_scalar(),
            Some(Complex64::new(3.0, 0.0))
        );

        vec.set("x", Complex64::new(1.0, 2.0)).expect("set complex");
        assert_eq!(vec.get("x").expect("get"), Complex64::new(1.0, 2.0));

        vec.set_complex_step_mode(false).expect("disable");
        assert_eq!(vec.get("x").expect("get"), 1.0);
        assert_eq!(vec.imag_flat_array().expect("borrow").expect("imag")[0], 2.0);
    }

    #[test]
    fn real_mode_write_keeps_imaginary_plane() {
        let system = xy_system();
        let mut vec = Vector::builder(&system, VectorName::Nonlinear, VectorKind::Output)
            .settings(complex_settings())
            .build()
            .expect("vector");

        vec.set_complex_step_mode(true).expect("enable");
        vec.set("x", Complex64::new(1.0, 2.0)).expect("set");
        vec.set_complex_step_mode(false).expect("disable");
        vec.set("x", Complex64::new(5.0, 9.0)).expect("real-mode set");
        vec.set_complex_step_mode(true).expect("enable");
        assert_eq!(vec.get("x").expect("get"), Complex64::new(5.0, 2.0));
    }

    #[test]
    fn complex_step_mode_is_idempotent_and_requires_storage() {
        let system = xy_system();
        let mut real = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");
        real.set_complex_step_mode(false).expect("no-op");
        let err = real.set_complex_step_mode(true).expect_err("no imag plane");
        assert!(matches!(err, VectorError::ComplexStepUnavailable { .. }));

        let mut cplx = Vector::builder(&system, VectorName::Nonlinear, VectorKind::Output)
            .settings(complex_settings())
            .build()
            .expect("vector");
        cplx.set_complex_step_mode(true).expect("enable");
        cplx.set_complex_step_mode(true).expect("again");
        assert!(cplx.under_complex_step());
    }

    #[test]
    fn read_only_rejects_every_named_write() {
        let system = xy_system();
        let mut vec = Vector::builder(&system, VectorName::Nonlinear, VectorKind::Output)
            .settings(VectorSettings {
                read_only: true,
                ..VectorSettings::default()
            })
            .build()
            .expect("vector");

        let err = vec.set("x", 1.0).expect_err("read only");
        assert!(matches!(err, VectorError::ReadOnlyViolation { .. }));
        assert!(err.to_string().contains("'x' in output vector when it is read only"));
        assert!(vec
            .set_var("y", 1.0, &Indexer::indices(vec![0], false), None)
            .is_err());
        assert!(vec.set_var("y", 1.0, &Indexer::FLAT_FULL, None).is_err());
        assert!(vec.set_all([0.0, 0.0, 0.0, 0.0]).is_err());
        assert_eq!(vec.get("x").expect("reads still work"), 0.0);

        vec.set_by_absolute("x", 4.0, false).expect("kernels may write");
        assert_eq!(vec.get("x").expect("get"), 4.0);
    }

    #[test]
    fn unknown_names_report_system_and_vector() {
        let system = System::builder("sub")
            .input("a", Shape::scalar())
            .build()
            .expect("valid system");
        let vec = Vector::new(&system, VectorName::Linear, VectorKind::Input).expect("vector");
        let err = vec.get("b").expect_err("missing");
        assert_eq!(
            err.to_string(),
            "'sub' <System> (linear input vector): Variable name 'b' not found."
        );
        assert!(vec.get("a").is_ok());
        assert!(vec.get_by_absolute("sub.a", false).is_ok());
        assert!(vec.get_by_absolute("a", false).is_err());
    }

    #[test]
    fn promoted_names_resolve() {
        let system = System::builder("model")
            .output("comp.z", Shape::vector(2))
            .promote(IoType::Output, "z", "comp.z")
            .build()
            .expect("valid system");
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");
        vec.set("z", [1.0, 2.0]).expect("promoted set");
        assert_eq!(vec.get("comp.z").expect("relative get").real().data(), &[1.0, 2.0]);
        assert!(vec.contains("z"));
        assert!(vec.contains_abs("model.comp.z"));
        assert_eq!(vec.keys().collect::<Vec<_>>(), ["comp.z"]);
    }

    #[test]
    fn set_broadcasts_scalars_and_reshapes_arrays() {
        let system = System::builder("")
            .output("m", Shape::new([2, 2]))
            .build()
            .expect("valid system");
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");

        vec.set("m", 7.0).expect("broadcast");
        assert_eq!(&*vec.as_flat_array().expect("flat"), &[7.0; 4]);

        vec.set("m", vec![1.0, 2.0, 3.0, 4.0]).expect("reshape");
        let m = vec.get("m").expect("get");
        assert_eq!(m.shape(), &Shape::new([2, 2]));
        assert_eq!(m.real().get(&[1, 0]), Some(&3.0));

        let err = vec.set("m", [1.0, 2.0, 3.0]).expect_err("mismatch");
        assert!(matches!(err, VectorError::ShapeMismatch { .. }));
        assert!(err.to_string().contains("from shape (3,) into shape (2, 2)"));
    }

    #[test]
    fn set_follows_numpy_broadcasting() {
        let system = System::builder("")
            .output("y", Shape::vector(3))
            .output("m", Shape::new([3, 2]))
            .build()
            .expect("valid system");
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");

        vec.set("y", vec![5.0]).expect("length-one broadcast");
        assert_eq!(vec.get("y").expect("get").real().data(), &[5.0; 3]);

        vec.set("m", [1.0, 2.0]).expect("row broadcast");
        assert_eq!(
            vec.get("m").expect("get").real().data(),
            &[1.0, 2.0, 1.0, 2.0, 1.0, 2.0]
        );

        let column = Tensor::new([3, 1], vec![1.0, 2.0, 3.0]).expect("column");
        vec.set("m", column).expect("column broadcast");
        assert_eq!(
            vec.get("m").expect("get").real().data(),
            &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0]
        );

        vec.set_var("m", [7.0, 8.0], &Indexer::indices(vec![0, 2], false), None)
            .expect("broadcast into selected rows");
        assert_eq!(
            vec.get("m").expect("get").real().data(),
            &[7.0, 8.0, 2.0, 2.0, 7.0, 8.0]
        );

        let err = vec.set("m", [1.0, 2.0, 3.0]).expect_err("trailing mismatch");
        assert!(err.to_string().contains("from shape (3,) into shape (3, 2)"));
    }

    #[test]
    fn indexed_and_flat_set_var() {
        let system = System::builder("")
            .output("m", Shape::new([3, 2]))
            .build()
            .expect("valid system");
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");

        vec.set_var("m", [1.0, 2.0], &Indexer::indices(vec![-1], false), None)
            .expect("row write");
        assert_eq!(&*vec.as_flat_array().expect("flat"), &[0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);

        vec.set_var("m", 9.0, &Indexer::slice(None, None, Some(2), true), None)
            .expect("flat stride write");
        assert_eq!(&*vec.as_flat_array().expect("flat"), &[9.0, 0.0, 9.0, 0.0, 9.0, 2.0]);

        let err = vec
            .set_var("m", 1.0, &Indexer::indices(vec![3], false), Some("alias"))
            .expect_err("out of bounds");
        assert!(matches!(err, VectorError::InvalidIndex(_)));

        let err = vec
            .set_var("q", 1.0, &Indexer::FULL, Some("alias"))
            .expect_err("unknown");
        assert!(err.to_string().contains("'alias' not found"));
    }

    #[test]
    fn relevance_masks_iteration_but_not_storage() {
        let system = xy_system();
        let mut vec = Vector::new(&system, VectorName::Linear, VectorKind::Output)
            .expect("vector");
        vec.set("x", 1.5).expect("set x");
        vec.set("y", [1.0, 2.0, 3.0]).expect("set y");

        vec.set_relevant(["y"]).expect("restrict");
        assert!(vec.in_matvec_context());

        let values: Vec<Value> = vec.values().expect("values").collect();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1].real().data(), &[1.0, 2.0, 3.0]);

        let names: Vec<String> = vec.iter(true).expect("iter").map(|(n, _)| n).collect();
        assert_eq!(names, ["y"]);
        assert!(!vec.contains("x"));
        assert!(vec.get("x").is_err());
        assert_eq!(vec.get_by_absolute("x", false).expect("absolute"), 1.5);

        vec.reset_relevance();
        assert_eq!(vec.iter(true).expect("iter").count(), 2);
        assert!(vec.set_relevant(["nope"]).is_err());
    }

    #[test]
    fn matvec_context_restores_previous_relevance() {
        let system = xy_system();
        let mut vec = Vector::new(&system, VectorName::Linear, VectorKind::Output)
            .expect("vector");
        let seen = vec
            .matvec_context(["x"], |v| v.keys().map(str::to_string).collect::<Vec<_>>())
            .expect("context");
        assert_eq!(seen, ["x"]);
        assert!(!vec.in_matvec_context());
    }

    #[test]
    fn set_all_is_positional_and_checks_total_size() {
        let system = xy_system();
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");
        vec.set_all([Value::from(1.0), Value::from(vec![2.0, 3.0, 4.0])])
            .expect("set all");
        assert_eq!(&*vec.as_flat_array().expect("flat"), &[1.0, 2.0, 3.0, 4.0]);

        let err = vec.set_all([1.0, 2.0]).expect_err("short");
        assert!(matches!(err, VectorError::ShapeMismatch { .. }));
    }

    #[test]
    fn bulk_fills_and_copies() {
        let system = xy_system();
        let mut a = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");
        let mut b = Vector::new(&system, VectorName::Nonlinear, VectorKind::Residual)
            .expect("vector");

        a.set_scalar(2.0).expect("fill");
        b.set_from_vector(&a).expect("copy");
        assert_eq!(&*b.as_flat_array().expect("flat"), &[2.0; 4]);

        b.set_val(-1.0, &Indexer::slice(Some(1), Some(3), None, true))
            .expect("indexed fill");
        assert_eq!(&*b.as_flat_array().expect("flat"), &[2.0, -1.0, -1.0, 2.0]);
        assert_eq!(b.to_flat_vec().expect("copy"), vec![2.0, -1.0, -1.0, 2.0]);
    }

    #[test]
    fn local_views_reinterpret_external_buffers() {
        let system = System::builder("sub")
            .output("a", Shape::scalar())
            .output("b", Shape::new([2, 2]))
            .build()
            .expect("valid system");
        let vec = Vector::new(&system, VectorName::Linear, VectorKind::Output).expect("vector");

        let buffer = [1.0, 2.0, 3.0, 4.0, 5.0];
        let views = vec.local_views(&buffer).expect("views");
        assert_eq!(views["a"].as_scalar(), Some(1.0));
        assert_eq!(views["b"].get(&[1, 1]), Some(5.0));

        let mut scratch = vec![0.0; 5];
        {
            let mut views = vec.local_views_mut(&mut scratch).expect("views");
            views["b"].fill(1.0);
            if let Some(a) = views.get_mut("a") {
                a.data_mut()[0] = 9.0;
            }
        }
        assert_eq!(scratch, vec![9.0, 1.0, 1.0, 1.0, 1.0]);
        assert_eq!(&*vec.as_flat_array().expect("flat"), &[0.0; 5]);

        let err = vec.local_views(&buffer[..3]).expect_err("size");
        assert!(matches!(
            err,
            VectorError::SizeMismatch {
                expected: 5,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn own_views_read_the_vector_buffer() {
        let system = System::builder("sub")
            .output("a", Shape::scalar())
            .output("b", Shape::new([2, 2]))
            .build()
            .expect("valid system");
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");
        vec.set_all([Value::from(1.0), Value::from(vec![2.0, 3.0, 4.0, 5.0])])
            .expect("fill");
        let mut alias = Vector::builder(&system, VectorName::Nonlinear, VectorKind::Output)
            .root(&vec)
            .build()
            .expect("alias");

        {
            let views = vec.own_views().expect("views");
            assert_eq!(views.len(), 2);
            assert_eq!(views.get("a").and_then(|a| a.as_scalar()), Some(1.0));
            assert_eq!(views.get("b").and_then(|b| b.get(&[1, 0])), Some(4.0));
            assert!(views.get("sub.b").is_none());
            let names: Vec<_> = views.iter().map(|(name, _)| name).collect();
            assert_eq!(names, ["a", "b"]);
            assert!(matches!(
                alias.set_by_absolute("sub.a", 0.0, false),
                Err(VectorError::BufferBorrowed { .. })
            ));
        }
        alias.set("a", 6.0).expect("released");
        let views = vec.own_views().expect("views");
        assert_eq!(views.get("a").and_then(|a| a.as_scalar()), Some(6.0));
    }

    #[test]
    fn copy_vars_and_abs_items_return_stored_values() {
        let system = xy_system();
        let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
            .expect("vector");
        vec.set("y", [4.0, 5.0, 6.0]).expect("set");
        let copy = vec.copy_vars().expect("copy");
        assert_eq!(copy.len(), vec.nvars());
        assert_eq!(copy["x"], 0.0);
        let flat: Vec<_> = vec.abs_items(true).expect("items").collect();
        assert_eq!(flat[0].1.shape(), &Shape::vector(1));
        assert_eq!(vec.abs_names().collect::<Vec<_>>(), ["x", "y"]);
        assert_eq!(&*vec.flat_view("y").expect("view"), &[4.0, 5.0, 6.0]);
        assert!(vec.flat_view("q").is_err());
    }

    proptest! {
        #[test]
        fn views_partition_the_buffer(sizes in prop::collection::vec(0usize..5, 1..6)) {
            let mut builder = System::builder("");
            for (i, size) in sizes.iter().enumerate() {
                builder = builder.output(&format!("v{i}"), Shape::vector(*size));
            }
            let system = builder.build().expect("valid system");
            let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
                .expect("vector");

            prop_assert_eq!(vec.len(), sizes.iter().sum::<usize>());
            for i in 0..sizes.len() {
                vec.set(&format!("v{i}"), (i + 1) as f64).expect("set");
            }
            let mut expected = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                expected.extend(std::iter::repeat((i + 1) as f64).take(*size));
            }
            let flat = vec.to_flat_vec().expect("flat");
            prop_assert_eq!(flat, expected);
        }

        #[test]
        fn set_get_round_trip(x in -1e9f64..1e9, y in prop::collection::vec(-1e9f64..1e9, 3)) {
            let system = xy_system();
            let mut vec = Vector::new(&system, VectorName::Nonlinear, VectorKind::Output)
                .expect("vector");
            vec.set("x", x).expect("set x");
            vec.set("y", y.clone()).expect("set y");
            prop_assert_eq!(vec.get("x").expect("get x"), x);
            let stored = vec.get("y").expect("get y").real();
            prop_assert_eq!(stored.data(), y.as_slice());
        }
    }
}
