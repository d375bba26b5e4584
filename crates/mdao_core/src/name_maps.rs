//! Promoted, relative and absolute variable names.
//!
//! A variable has one absolute name (its full dotted path from the model root)
//! but can be addressed from a hierarchy node by a relative name (the absolute
//! name minus the node's pathname) or by any name it was promoted to.

use std::collections::HashMap;

use crate::vector::IoType;

/// Joins a node pathname and a relative name into an absolute name.
pub fn rel_name2abs_name(pathname: &str, rel_name: &str) -> String {
    if pathname.is_empty() {
        rel_name.to_string()
    } else {
        format!("{pathname}.{rel_name}")
    }
}

/// Strips a node's pathname prefix from an absolute name.
///
/// Names outside the node are returned unchanged.
pub fn abs_name2rel_name<'a>(pathname: &str, abs_name: &'a str) -> &'a str {
    if pathname.is_empty() {
        return abs_name;
    }
    abs_name
        .strip_prefix(pathname)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(abs_name)
}

/// Promoted-name lookup tables for one hierarchy node.
#[derive(Debug, Clone, Default)]
pub struct NameResolver {
    pathname: String,
    inputs: HashMap<String, Vec<String>>,
    outputs: HashMap<String, Vec<String>>,
}

impl NameResolver {
    pub fn new(pathname: impl Into<String>) -> Self {
        Self {
            pathname: pathname.into(),
            ..Self::default()
        }
    }

    pub fn pathname(&self) -> &str {
        &self.pathname
    }

    fn table(&self, io: IoType) -> &HashMap<String, Vec<String>> {
        match io {
            IoType::Input => &self.inputs,
            IoType::Output => &self.outputs,
        }
    }

    /// Records that `abs_name` is visible at this node as `prom_name`.
    ///
    /// Several inputs may share a promoted name; such a name is then ambiguous
    /// and never resolves.
    pub fn add_promoted(
        &mut self,
        io: IoType,
        prom_name: impl Into<String>,
        abs_name: impl Into<String>,
    ) {
        let table = match io {
            IoType::Input => &mut self.inputs,
            IoType::Output => &mut self.outputs,
        };
        let abs_name = abs_name.into();
        let entry = table.entry(prom_name.into()).or_default();
        if !entry.contains(&abs_name) {
            entry.push(abs_name);
        }
    }

    /// The unique absolute name promoted as `prom_name`, if any.
    pub fn prom2abs(&self, io: IoType, prom_name: &str) -> Option<&str> {
        match self.table(io).get(prom_name).map(Vec::as_slice) {
            Some([single]) => Some(single.as_str()),
            _ => None,
        }
    }

    /// Number of absolute names behind a promoted name.
    pub fn promoted_count(&self, io: IoType, prom_name: &str) -> usize {
        self.table(io).get(prom_name).map_or(0, Vec::len)
    }

    /// Maps a relative or promoted name to an absolute name accepted by `known`.
    ///
    /// The relative form is tried first since it is the common case; the
    /// promoted tables are consulted only when it misses.
    pub fn resolve(&self, io: IoType, name: &str, known: impl Fn(&str) -> bool) -> Option<String> {
        let abs_name = rel_name2abs_name(&self.pathname, name);
        if known(&abs_name) {
            return Some(abs_name);
        }
        self.prom2abs(io, name)
            .filter(|abs| known(abs))
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_and_absolute_names_round_trip() {
        assert_eq!(rel_name2abs_name("", "x"), "x");
        assert_eq!(rel_name2abs_name("sub.comp", "x"), "sub.comp.x");
        assert_eq!(abs_name2rel_name("sub", "sub.comp.x"), "comp.x");
        assert_eq!(abs_name2rel_name("", "sub.comp.x"), "sub.comp.x");
        assert_eq!(abs_name2rel_name("other", "sub.comp.x"), "sub.comp.x");
        assert_eq!(abs_name2rel_name("sub", "subway.x"), "subway.x");
    }

    #[test]
    fn promoted_names_resolve_only_when_unique() {
        let mut resolver = NameResolver::new("model");
        resolver.add_promoted(IoType::Input, "x", "model.c1.x");
        resolver.add_promoted(IoType::Input, "y", "model.c1.y");
        resolver.add_promoted(IoType::Input, "y", "model.c2.y");

        assert_eq!(resolver.prom2abs(IoType::Input, "x"), Some("model.c1.x"));
        assert_eq!(resolver.prom2abs(IoType::Input, "y"), None);
        assert_eq!(resolver.promoted_count(IoType::Input, "y"), 2);
        assert_eq!(resolver.prom2abs(IoType::Output, "x"), None);
    }

    #[test]
    fn resolve_prefers_relative_form() {
        let mut resolver = NameResolver::new("model");
        resolver.add_promoted(IoType::Output, "c1.z", "model.c2.z");
        let known = |n: &str| n == "model.c1.z" || n == "model.c2.z";

        assert_eq!(
            resolver.resolve(IoType::Output, "c1.z", known).as_deref(),
            Some("model.c1.z")
        );

        let only_c2 = |n: &str| n == "model.c2.z";
        assert_eq!(
            resolver.resolve(IoType::Output, "c1.z", only_c2).as_deref(),
            Some("model.c2.z")
        );
        assert_eq!(resolver.resolve(IoType::Output, "nope", known), None);
    }
}
