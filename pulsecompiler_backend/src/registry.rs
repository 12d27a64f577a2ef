//! Static plugin registries and the masked "currently selected method" view over them.
//!
//! All four strategy families (sampling functions, predefined generators, extraction methods and
//! analysis methods) share the same shape:
//!
//! - Entries implement [`RegistryEntry`]: a name plus a declared parameter schema.
//! - Entries are contributed by [`PluginModule`]s, grouped into named [`PluginRoot`]s. A module is
//!   a plain function returning its entries, so the full plugin set is known at build time.
//! - [`Registry`] is an immutable snapshot built once from an ordered list of roots. A module whose
//!   loader fails is dropped with a warning and the remaining modules stay available. The first
//!   discovery of a name wins, later roots never override it.
//! - [`MethodSelection`] tracks the selected entry and per-entry parameter values. Parameter updates
//!   only ever reach the selected entry.
//!
//! Rebuilding with other roots produces a new [`Registry`] value, existing snapshots held by other
//! threads are unaffected.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{PulsedError, Result};
use crate::params::{resolve_params, ParamSet, ParamSpec};

/// Name of the root that is always loaded first.
pub const BUILTIN_ROOT: &str = "builtin";

pub trait RegistryEntry: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> &[ParamSpec];
}

/// Implements [`RegistryEntry`] for structs carrying `name: String` and `schema: Vec<ParamSpec>`.
#[macro_export]
macro_rules! impl_registry_entry {
    ($type:ty) => {
        impl $crate::registry::RegistryEntry for $type {
            fn name(&self) -> &str {
                &self.name
            }
            fn schema(&self) -> &[$crate::params::ParamSpec] {
                &self.schema
            }
        }
    };
}

/// A loadable unit of strategies.
pub struct PluginModule<E> {
    pub name: &'static str,
    pub load: fn() -> Result<Vec<E>>,
}

/// A named group of modules, the unit referenced from configuration.
pub struct PluginRoot<E> {
    pub name: &'static str,
    pub modules: Vec<PluginModule<E>>,
}

/// Immutable registry snapshot.
pub struct Registry<E> {
    kind: String,
    entries: Arc<IndexMap<String, Arc<E>>>,
    failed_modules: Arc<Vec<String>>,
}

impl<E> Clone for Registry<E> {
    fn clone(&self) -> Self {
        Registry {
            kind: self.kind.clone(),
            entries: self.entries.clone(),
            failed_modules: self.failed_modules.clone(),
        }
    }
}

impl<E: RegistryEntry> Registry<E> {
    /// Loads every module of `roots` in order.
    pub fn build(kind: &str, roots: &[&PluginRoot<E>]) -> Self {
        let mut entries: IndexMap<String, Arc<E>> = IndexMap::new();
        let mut failed_modules = Vec::new();
        for root in roots {
            for module in &root.modules {
                match (module.load)() {
                    Ok(loaded) => {
                        for entry in loaded {
                            let name = entry.name().to_string();
                            if entries.contains_key(&name) {
                                tracing::debug!(
                                    "{} '{}' from module '{}' shadowed by an earlier discovery",
                                    kind,
                                    name,
                                    module.name
                                );
                                continue;
                            }
                            entries.insert(name, Arc::new(entry));
                        }
                    }
                    Err(err) => {
                        let err = PulsedError::PluginLoad {
                            module: format!("{}/{}", root.name, module.name),
                            reason: err.to_string(),
                        };
                        tracing::warn!("{}: {}", kind, err);
                        failed_modules.push(module.name.to_string());
                    }
                }
            }
        }
        tracing::debug!("Built {} registry with {} entries", kind, entries.len());
        Registry {
            kind: kind.to_string(),
            entries: Arc::new(entries),
            failed_modules: Arc::new(failed_modules),
        }
    }

    /// Resolves configured root names against `catalog` and builds from them.
    ///
    /// The builtin root is always loaded first. Unknown root names are reported and skipped.
    pub fn from_catalog(kind: &str, catalog: &[PluginRoot<E>], extra_roots: &[String]) -> Self {
        let mut selected: Vec<&PluginRoot<E>> = Vec::new();
        let builtin = catalog.iter().find(|root| root.name == BUILTIN_ROOT);
        selected.extend(builtin);
        for root_name in extra_roots {
            match catalog.iter().find(|root| root.name == root_name.as_str()) {
                Some(root) if selected.iter().any(|r| r.name == root.name) => {}
                Some(root) => selected.push(root),
                None => {
                    let err = PulsedError::PluginLoad {
                        module: root_name.clone(),
                        reason: "no such plugin root".to_string(),
                    };
                    tracing::warn!("{}: {}", kind, err);
                }
            }
        }
        Self::build(kind, &selected)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn get(&self, name: &str) -> Result<Arc<E>> {
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| PulsedError::lookup(&self.kind, name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// All available names with their declared schemas.
    pub fn schemas(&self) -> IndexMap<String, Vec<ParamSpec>> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.clone(), entry.schema().to_vec()))
            .collect()
    }

    pub fn failed_modules(&self) -> &[String] {
        &self.failed_modules
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Selected method plus the parameter values stored for each method of a registry.
pub struct MethodSelection<E> {
    registry: Registry<E>,
    current: String,
    stored: HashMap<String, ParamSet>,
}

impl<E> Clone for MethodSelection<E> {
    fn clone(&self) -> Self {
        MethodSelection {
            registry: self.registry.clone(),
            current: self.current.clone(),
            stored: self.stored.clone(),
        }
    }
}

impl<E: RegistryEntry> MethodSelection<E> {
    /// Selects `default_method`, or the first registered entry if it is unavailable.
    pub fn new(registry: Registry<E>, default_method: &str) -> Result<Self> {
        let current = if registry.contains(default_method) {
            default_method.to_string()
        } else {
            registry
                .names()
                .into_iter()
                .next()
                .ok_or_else(|| PulsedError::lookup(registry.kind(), default_method))?
        };
        Ok(MethodSelection {
            registry,
            current,
            stored: HashMap::new(),
        })
    }

    pub fn registry(&self) -> &Registry<E> {
        &self.registry
    }

    pub fn current_method(&self) -> &str {
        &self.current
    }

    pub fn current_entry(&self) -> Result<Arc<E>> {
        self.registry.get(&self.current)
    }

    pub fn set_method(&mut self, name: &str) -> Result<()> {
        if !self.registry.contains(name) {
            return Err(PulsedError::lookup(self.registry.kind(), name));
        }
        self.current = name.to_string();
        Ok(())
    }

    /// Stored values of `name` merged over its declared defaults.
    pub fn parameters_of(&self, name: &str) -> Result<ParamSet> {
        let entry = self.registry.get(name)?;
        match self.stored.get(name) {
            Some(stored) => resolve_params(name, entry.schema(), stored),
            None => Ok(ParamSet::defaults(entry.schema())),
        }
    }

    pub fn current_parameters(&self) -> Result<ParamSet> {
        self.parameters_of(&self.current)
    }

    /// Applies `params` to the selected method only.
    ///
    /// A `method` key switches the selection first. Unknown keys are ignored with a warning.
    /// Invalid values reject the whole update and leave the stored values untouched.
    pub fn set_parameters(&mut self, params: &ParamSet) -> Result<ParamSet> {
        if let Some(method) = params.get("method") {
            let method = method.as_str().ok_or_else(|| {
                PulsedError::config(format!("'method' must be a string, got '{}'", method))
            })?;
            self.set_method(method)?;
        }
        let entry = self.current_entry()?;
        let mut merged = self.current_parameters()?;
        for (key, value) in params.iter().filter(|(key, _)| key.as_str() != "method") {
            merged.insert(key, value.clone());
        }
        let resolved = resolve_params(&self.current, entry.schema(), &merged)?;
        self.stored.insert(self.current.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Swaps in a new registry snapshot, keeping stored values of methods that still exist.
    pub fn replace_registry(&mut self, registry: Registry<E>) -> Result<()> {
        self.stored.retain(|name, _| registry.contains(name));
        if !registry.contains(&self.current) {
            self.current = registry
                .names()
                .into_iter()
                .next()
                .ok_or_else(|| PulsedError::lookup(registry.kind(), &self.current))?;
        }
        self.registry = registry;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Dummy {
        name: String,
        schema: Vec<ParamSpec>,
    }
    impl_registry_entry!(Dummy);

    fn dummy(name: &str, param: &str) -> Dummy {
        Dummy {
            name: name.to_string(),
            schema: vec![ParamSpec::float(param, "s", 1.0, 0.0, 10.0)],
        }
    }

    fn good_module() -> Result<Vec<Dummy>> {
        Ok(vec![dummy("alpha", "a"), dummy("beta", "b")])
    }

    fn broken_module() -> Result<Vec<Dummy>> {
        Err(PulsedError::config("import failed"))
    }

    fn extra_module() -> Result<Vec<Dummy>> {
        Ok(vec![dummy("alpha", "shadowed"), dummy("gamma", "c")])
    }

    fn catalog() -> Vec<PluginRoot<Dummy>> {
        vec![
            PluginRoot {
                name: BUILTIN_ROOT,
                modules: vec![
                    PluginModule { name: "good", load: good_module },
                    PluginModule { name: "broken", load: broken_module },
                ],
            },
            PluginRoot {
                name: "extra",
                modules: vec![PluginModule { name: "extra", load: extra_module }],
            },
        ]
    }

    #[test]
    fn failing_module_is_dropped() {
        let registry = Registry::from_catalog("dummies", &catalog(), &[]);
        assert_eq!(registry.names(), vec!["alpha", "beta"]);
        assert_eq!(registry.failed_modules(), &["broken".to_string()]);
    }

    #[test]
    fn earlier_roots_win() {
        let roots = vec!["extra".to_string(), "missing".to_string()];
        let registry = Registry::from_catalog("dummies", &catalog(), &roots);
        assert_eq!(registry.names(), vec!["alpha", "beta", "gamma"]);
        let alpha = registry.get("alpha").unwrap();
        assert_eq!(alpha.schema()[0].name, "a");
    }

    #[test]
    fn unknown_name_is_lookup_error() {
        let registry = Registry::from_catalog("dummies", &catalog(), &[]);
        assert!(matches!(
            registry.get("delta"),
            Err(PulsedError::Lookup { .. })
        ));
        let mut selection = MethodSelection::new(registry, "alpha").unwrap();
        assert!(matches!(
            selection.set_method("delta"),
            Err(PulsedError::Lookup { .. })
        ));
        assert_eq!(selection.current_method(), "alpha");
    }

    #[test]
    fn parameters_only_reach_selected_method() {
        let registry = Registry::from_catalog("dummies", &catalog(), &[]);
        let mut selection = MethodSelection::new(registry, "alpha").unwrap();
        let before_beta = selection.parameters_of("beta").unwrap();

        selection
            .set_parameters(&ParamSet::new().with("a", 5.0).with("b", 7.0))
            .unwrap();
        assert_eq!(selection.current_parameters().unwrap().f64("a").unwrap(), 5.0);
        assert_eq!(selection.parameters_of("beta").unwrap(), before_beta);

        selection
            .set_parameters(&ParamSet::new().with("method", "beta").with("b", 3.0))
            .unwrap();
        assert_eq!(selection.current_method(), "beta");
        assert_eq!(selection.parameters_of("alpha").unwrap().f64("a").unwrap(), 5.0);
        assert_eq!(selection.current_parameters().unwrap().f64("b").unwrap(), 3.0);
    }

    #[test]
    fn invalid_update_keeps_previous_values() {
        let registry = Registry::from_catalog("dummies", &catalog(), &[]);
        let mut selection = MethodSelection::new(registry, "alpha").unwrap();
        selection.set_parameters(&ParamSet::new().with("a", 2.0)).unwrap();
        assert!(selection
            .set_parameters(&ParamSet::new().with("a", 20.0))
            .is_err());
        assert_eq!(selection.current_parameters().unwrap().f64("a").unwrap(), 2.0);
    }

    #[test]
    fn snapshots_are_independent() {
        let registry = Registry::from_catalog("dummies", &catalog(), &[]);
        let mut selection = MethodSelection::new(registry.clone(), "alpha").unwrap();
        let bigger = Registry::from_catalog("dummies", &catalog(), &["extra".to_string()]);
        selection.replace_registry(bigger).unwrap();
        assert!(selection.registry().contains("gamma"));
        assert!(!registry.contains("gamma"));
    }
}
