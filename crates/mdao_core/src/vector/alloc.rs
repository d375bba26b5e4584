//! Buffer allocation for root vectors and aliasing for child vectors.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use super::{IoType, SharedData, VarView, Vector, VectorData};
use crate::error::{Result, VectorError};
use crate::system::System;

pub(crate) struct Allocation {
    pub(crate) data: SharedData,
    pub(crate) root_offset: usize,
    pub(crate) is_root: bool,
    pub(crate) len: usize,
    pub(crate) root_len: usize,
    pub(crate) complex: bool,
    pub(crate) views: IndexMap<String, VarView>,
}

/// Lays the variables of `io` out back to back in a fresh zeroed buffer.
pub(crate) fn allocate_root(system: &System, io: IoType, alloc_complex: bool) -> Allocation {
    let mut views = IndexMap::new();
    let mut end = 0;
    for meta in system.variables(io) {
        views.insert(
            meta.abs_name.clone(),
            VarView {
                start: end,
                shape: meta.shape.clone(),
            },
        );
        end += meta.size();
    }

    let data = VectorData {
        real: vec![0.0; end],
        imag: alloc_complex.then(|| vec![0.0; end]),
        normalized: Vec::new(),
    };
    Allocation {
        data: Rc::new(RefCell::new(data)),
        root_offset: 0,
        is_root: true,
        len: end,
        root_len: end,
        complex: alloc_complex,
        views,
    }
}

/// Maps the variables of `system` onto the buffer of `root`.
///
/// The variables must occupy one contiguous run of the root's layout, in the
/// same order and with the same shapes.
pub(crate) fn allocate_child(
    system: &System,
    io: IoType,
    root: &Vector<'_>,
    alloc_complex: bool,
    context: &str,
) -> Result<Allocation> {
    let layout = |reason: String| VectorError::LayoutMismatch {
        context: context.to_string(),
        reason,
    };

    if root.io_type() != io {
        return Err(layout(format!(
            "root vector stores {:?} variables, expected {:?}",
            root.io_type(),
            io
        )));
    }
    if alloc_complex && !root.complex {
        return Err(layout(
            "complex storage requested but the root vector has no imaginary plane".to_string(),
        ));
    }

    let vars = system.variables(io);
    let root_offset = match vars.first() {
        Some(first) => {
            let view = root.views.get(&first.abs_name).ok_or_else(|| {
                layout(format!(
                    "variable '{}' is not allocated in the root vector",
                    first.abs_name
                ))
            })?;
            root.root_offset + view.start
        }
        None => root.root_offset,
    };

    let mut views = IndexMap::with_capacity(vars.len());
    let mut cursor = 0;
    for meta in vars {
        let root_view = root.views.get(&meta.abs_name).ok_or_else(|| {
            layout(format!(
                "variable '{}' is not allocated in the root vector",
                meta.abs_name
            ))
        })?;
        if root_view.shape != meta.shape {
            return Err(layout(format!(
                "variable '{}' has shape {} but the root vector stores shape {}",
                meta.abs_name, meta.shape, root_view.shape
            )));
        }
        if root.root_offset + root_view.start != root_offset + cursor {
            return Err(layout(format!(
                "variable '{}' is not contiguous with the preceding variables in the root vector",
                meta.abs_name
            )));
        }
        views.insert(
            meta.abs_name.clone(),
            VarView {
                start: cursor,
                shape: meta.shape.clone(),
            },
        );
        cursor += meta.size();
    }

    Ok(Allocation {
        data: root.data.clone(),
        root_offset,
        is_root: false,
        len: cursor,
        root_len: root.root_len,
        complex: root.complex,
        views,
    })
}
