//! The hierarchy-node data a vector is built from.
//!
//! Model assembly lives outside this crate; [`System`] is the slice of it the
//! vector layer needs: the node's pathname, its variables in allocation order,
//! their scale factors, promoted names and the scaling-requirement flags.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::name_maps::{rel_name2abs_name, NameResolver};
use crate::scaling::ScaleFactors;
use crate::value::Shape;
use crate::vector::{IoType, VectorKind};

/// Which kinds of vector owned by a node need scaling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingFlags {
    pub has_input_scaling: bool,
    pub has_output_scaling: bool,
    pub has_resid_scaling: bool,
    pub has_input_adder: bool,
    pub has_output_adder: bool,
}

impl ScalingFlags {
    pub fn do_scaling(&self, kind: VectorKind) -> bool {
        match kind {
            VectorKind::Input => self.has_input_scaling,
            VectorKind::Output => self.has_output_scaling,
            VectorKind::Residual => self.has_resid_scaling,
        }
    }

    /// Residual vectors key off the resid scaling flag; there is no separate
    /// resid adder flag.
    pub fn do_adder(&self, kind: VectorKind) -> bool {
        match kind {
            VectorKind::Input => self.has_input_adder,
            VectorKind::Output => self.has_output_adder,
            VectorKind::Residual => self.has_resid_scaling,
        }
    }
}

/// One variable as seen by the vector layer.
#[derive(Debug, Clone, PartialEq)]
pub struct VarMeta {
    pub abs_name: String,
    pub shape: Shape,
    pub scaling: Option<ScaleFactors>,
    /// Residual factors; only meaningful for outputs.
    pub resid_scaling: Option<ScaleFactors>,
}

impl VarMeta {
    pub fn size(&self) -> usize {
        self.shape.size()
    }

    pub fn factors_for(&self, kind: VectorKind) -> ScaleFactors {
        let factors = match kind {
            VectorKind::Input | VectorKind::Output => self.scaling,
            VectorKind::Residual => self.resid_scaling,
        };
        factors.unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct System {
    pathname: String,
    flags: ScalingFlags,
    resolver: NameResolver,
    inputs: Vec<VarMeta>,
    outputs: Vec<VarMeta>,
}

impl System {
    pub fn builder(pathname: impl Into<String>) -> SystemBuilder {
        SystemBuilder::new(pathname)
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    /// Prefix used in error messages to locate this node.
    pub fn msginfo(&self) -> String {
        if self.pathname.is_empty() {
            "<model> <System>".to_string()
        } else {
            format!("'{}' <System>", self.pathname)
        }
    }

    pub fn scaling_flags(&self) -> ScalingFlags {
        self.flags
    }

    pub fn resolver(&self) -> &NameResolver {
        &self.resolver
    }

    /// Variables of one family, in allocation order.
    pub fn variables(&self, io: IoType) -> &[VarMeta] {
        match io {
            IoType::Input => &self.inputs,
            IoType::Output => &self.outputs,
        }
    }

    pub fn var_meta(&self, io: IoType, abs_name: &str) -> Option<&VarMeta> {
        self.variables(io).iter().find(|m| m.abs_name == abs_name)
    }

    /// The node at `pathname` below this one, holding every variable whose
    /// absolute name lies under it. Scaling flags are derived from the
    /// selected variables.
    pub fn subsystem(&self, pathname: &str) -> Result<System> {
        let prefix = format!("{pathname}.");
        let select = |vars: &[VarMeta]| -> Vec<VarMeta> {
            vars.iter()
                .filter(|m| m.abs_name.starts_with(&prefix))
                .cloned()
                .collect()
        };
        let inputs = select(&self.inputs);
        let outputs = select(&self.outputs);
        if inputs.is_empty() && outputs.is_empty() {
            bail!("{}: no variables found under '{}'.", self.msginfo(), pathname);
        }

        Ok(System {
            pathname: pathname.to_string(),
            flags: derive_flags(&inputs, &outputs),
            resolver: NameResolver::new(pathname),
            inputs,
            outputs,
        })
    }
}

fn derive_flags(inputs: &[VarMeta], outputs: &[VarMeta]) -> ScalingFlags {
    let scaled = |f: &Option<ScaleFactors>| f.is_some_and(|f| !f.is_identity());
    let offset = |f: &Option<ScaleFactors>| f.is_some_and(|f| f.has_adder());
    ScalingFlags {
        has_input_scaling: inputs.iter().any(|m| scaled(&m.scaling)),
        has_output_scaling: outputs.iter().any(|m| scaled(&m.scaling)),
        has_resid_scaling: outputs.iter().any(|m| scaled(&m.resid_scaling)),
        has_input_adder: inputs.iter().any(|m| offset(&m.scaling)),
        has_output_adder: outputs.iter().any(|m| offset(&m.scaling)),
    }
}

/// Validating builder for [`System`]. Variable names are relative to the
/// builder's pathname.
#[derive(Debug, Clone)]
pub struct SystemBuilder {
    pathname: String,
    flags: Option<ScalingFlags>,
    inputs: Vec<VarMeta>,
    outputs: Vec<VarMeta>,
    promotions: Vec<(IoType, String, String)>,
}

impl SystemBuilder {
    pub fn new(pathname: impl Into<String>) -> Self {
        Self {
            pathname: pathname.into(),
            flags: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            promotions: Vec::new(),
        }
    }

    fn meta(&self, name: &str, shape: Shape) -> VarMeta {
        VarMeta {
            abs_name: rel_name2abs_name(&self.pathname, name),
            shape,
            scaling: None,
            resid_scaling: None,
        }
    }

    pub fn input(mut self, name: &str, shape: impl Into<Shape>) -> Self {
        let meta = self.meta(name, shape.into());
        self.inputs.push(meta);
        self
    }

    pub fn scaled_input(
        mut self,
        name: &str,
        shape: impl Into<Shape>,
        factors: ScaleFactors,
    ) -> Self {
        let mut meta = self.meta(name, shape.into());
        meta.scaling = Some(factors);
        self.inputs.push(meta);
        self
    }

    pub fn output(mut self, name: &str, shape: impl Into<Shape>) -> Self {
        let meta = self.meta(name, shape.into());
        self.outputs.push(meta);
        self
    }

    pub fn scaled_output(
        mut self,
        name: &str,
        shape: impl Into<Shape>,
        factors: ScaleFactors,
        resid_factors: Option<ScaleFactors>,
    ) -> Self {
        let mut meta = self.meta(name, shape.into());
        meta.scaling = Some(factors);
        meta.resid_scaling = resid_factors;
        self.outputs.push(meta);
        self
    }

    /// Makes the variable `rel_name` visible under `prom_name`.
    pub fn promote(mut self, io: IoType, prom_name: &str, rel_name: &str) -> Self {
        self.promotions
            .push((io, prom_name.to_string(), rel_name.to_string()));
        self
    }

    /// Overrides the flags otherwise derived from the declared factors.
    pub fn scaling_flags(mut self, flags: ScalingFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn build(self) -> Result<System> {
        let mut seen = HashSet::new();
        for meta in self.inputs.iter().chain(&self.outputs) {
            if !seen.insert(meta.abs_name.as_str()) {
                bail!("Variable '{}' is declared more than once.", meta.abs_name);
            }
            for factors in meta.scaling.iter().chain(&meta.resid_scaling) {
                if !factors.scaler.is_finite() || !factors.adder.is_finite() {
                    bail!("Scale factors for '{}' must be finite.", meta.abs_name);
                }
                if factors.scaler == 0.0 {
                    bail!("Scaler for '{}' must be nonzero.", meta.abs_name);
                }
            }
        }

        let mut resolver = NameResolver::new(self.pathname.clone());
        for (io, prom, rel) in &self.promotions {
            let abs = rel_name2abs_name(&self.pathname, rel);
            let vars = match io {
                IoType::Input => &self.inputs,
                IoType::Output => &self.outputs,
            };
            if !vars.iter().any(|m| m.abs_name == abs) {
                bail!("Cannot promote '{}': variable '{}' is not declared.", prom, abs);
            }
            resolver.add_promoted(*io, prom.clone(), abs);
        }

        let flags = self
            .flags
            .unwrap_or_else(|| derive_flags(&self.inputs, &self.outputs));

        Ok(System {
            pathname: self.pathname,
            flags,
            resolver,
            inputs: self.inputs,
            outputs: self.outputs,
        })
    }
}
