//! Capability registry.
//!
//! Each module a script can `require` is described by a marker type that
//! implements [`Capability`], tying the script-facing name to a statically
//! typed namespace. The host keeps one binder per provided name and, when a
//! script is loaded, binds every module the script is allowed to see into a
//! [`Grants`] table. Lookups afterwards only consult that table.

use std::{
    any::Any,
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use scriptbot_plugin_sdk::{CapabilityDenied, CapabilityName, Manifest};

use crate::{
    dispatch::{Listeners, Outbox},
    error::{HostError, RequireError},
    plugin::ScriptId,
};

/// Ties a module name to the namespace type scripts get back.
pub trait Capability: 'static {
    const NAME: CapabilityName;
    type Namespace: Send + Sync + 'static;
}

type AnyNamespace = Arc<dyn Any + Send + Sync>;
type Binder = Arc<dyn Fn(&Binding<'_>) -> AnyNamespace + Send + Sync>;

/// Everything a binder may use to build a namespace for one script.
pub struct Binding<'a> {
    pub script: ScriptId,
    pub manifest: &'a Manifest,
    pub outbox: &'a Outbox,
    pub(crate) listeners: &'a Arc<Listeners>,
}

#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    binders: HashMap<CapabilityName, Binder>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a binder that builds a fresh namespace per script.
    pub fn provide<C, F>(&mut self, binder: F)
    where
        C: Capability,
        F: Fn(&Binding<'_>) -> C::Namespace + Send + Sync + 'static,
    {
        self.binders
            .insert(C::NAME, Arc::new(move |binding: &Binding<'_>| {
                Arc::new(binder(binding)) as AnyNamespace
            }));
    }

    /// Installs one namespace shared by every script.
    pub fn provide_shared<C: Capability>(&mut self, namespace: Arc<C::Namespace>) {
        self.binders
            .insert(C::NAME, Arc::new(move |_: &Binding<'_>| namespace.clone() as AnyNamespace));
    }

    /// Stops providing `name`; returns whether it was provided.
    pub fn withhold(&mut self, name: CapabilityName) -> bool {
        self.binders.remove(&name).is_some()
    }

    pub fn provides(&self, name: CapabilityName) -> bool {
        self.binders.contains_key(&name)
    }

    pub fn names(&self) -> Vec<CapabilityName> {
        let mut names: Vec<_> = self.binders.keys().copied().collect();
        names.sort();
        names
    }

    /// Resolves `requiredModules` against what this host provides.
    pub fn check(&self, manifest: &Manifest) -> Result<(), HostError> {
        for module in &manifest.required_modules {
            let known = module
                .parse::<CapabilityName>()
                .is_ok_and(|name| self.provides(name));
            if !known {
                return Err(HostError::UnknownModule {
                    script: manifest.name.clone(),
                    module: module.clone(),
                });
            }
        }
        Ok(())
    }

    /// Binds every unprotected module plus the protected ones the manifest
    /// declares.
    pub(crate) fn bind(&self, binding: &Binding<'_>) -> Result<Grants, HostError> {
        self.check(binding.manifest)?;
        let declared = binding.manifest.declared_capabilities();
        let bound = self
            .binders
            .iter()
            .filter(|(name, _)| !name.is_protected() || declared.contains(name))
            .map(|(name, binder)| (*name, binder(binding)))
            .collect();
        Ok(Grants {
            script: binding.manifest.name.clone(),
            declared,
            bound,
        })
    }
}

/// Modules bound for one script at load time.
pub struct Grants {
    script: String,
    declared: BTreeSet<CapabilityName>,
    bound: HashMap<CapabilityName, AnyNamespace>,
}

impl Grants {
    pub fn require<C: Capability>(&self) -> Result<Arc<C::Namespace>, RequireError> {
        self.lookup(C::NAME)?
            .downcast::<C>()
            .ok_or(RequireError::Unavailable(C::NAME))
    }

    pub fn require_named(&self, name: &str) -> Result<CapabilityHandle, RequireError> {
        let name = name
            .parse::<CapabilityName>()
            .map_err(|_| RequireError::Unknown(name.to_string()))?;
        self.lookup(name)
    }

    fn lookup(&self, name: CapabilityName) -> Result<CapabilityHandle, RequireError> {
        if name.is_protected() && !self.declared.contains(&name) {
            metrics::counter!("scriptbot_require_total", "outcome" => "denied").increment(1);
            tracing::debug!(script = %self.script, module = %name, "protected module denied");
            return Err(RequireError::Denied(CapabilityDenied {
                capability: name,
                script: self.script.clone(),
            }));
        }
        let inner = self
            .bound
            .get(&name)
            .cloned()
            .ok_or(RequireError::Unavailable(name))?;
        metrics::counter!("scriptbot_require_total", "outcome" => "granted").increment(1);
        Ok(CapabilityHandle { name, inner })
    }

    pub fn granted(&self) -> Vec<CapabilityName> {
        let mut names: Vec<_> = self.bound.keys().copied().collect();
        names.sort();
        names
    }
}

/// Untyped view of a granted namespace, as returned by name lookups.
#[derive(Clone)]
pub struct CapabilityHandle {
    name: CapabilityName,
    inner: AnyNamespace,
}

impl CapabilityHandle {
    pub fn name(&self) -> CapabilityName {
        self.name
    }

    pub fn downcast<C: Capability>(&self) -> Option<Arc<C::Namespace>> {
        if C::NAME != self.name {
            return None;
        }
        self.inner.clone().downcast::<C::Namespace>().ok()
    }

    /// Whether both handles point at the same underlying namespace.
    pub fn same_namespace(&self, other: &CapabilityHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityHandle")
            .field("name", &self.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use tokio::sync::mpsc;

    use super::*;
    use crate::dispatch::EventHub;

    struct Db;
    struct DbNamespace {
        dsn: String,
    }
    impl Capability for Db {
        const NAME: CapabilityName = CapabilityName::Db;
        type Namespace = DbNamespace;
    }

    struct Clock;
    impl Capability for Clock {
        const NAME: CapabilityName = CapabilityName::Helpers;
        type Namespace = u64;
    }

    fn registry() -> CapabilityRegistry {
        let mut registry = CapabilityRegistry::new();
        registry.provide::<Db, _>(|binding| DbNamespace {
            dsn: format!("sqlite://{}", binding.manifest.name),
        });
        registry.provide_shared::<Clock>(Arc::new(7));
        registry
    }

    fn grants(registry: &CapabilityRegistry, manifest: &Manifest) -> Result<Grants, HostError> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(ScriptId(0), Arc::new(AtomicU64::new(0)), tx, EventHub::new());
        let listeners = Arc::new(Listeners::default());
        registry.bind(&Binding {
            script: ScriptId(0),
            manifest,
            outbox: &outbox,
            listeners: &listeners,
        })
    }

    #[test]
    fn declared_protected_module_is_granted() {
        let manifest = Manifest::new("T", "A", "D", "1.0").with_modules(["db"]);
        let grants = grants(&registry(), &manifest).unwrap();
        assert_eq!(grants.require::<Db>().unwrap().dsn, "sqlite://T");
        assert_eq!(*grants.require::<Clock>().unwrap(), 7);
    }

    #[test]
    fn undeclared_protected_module_is_denied() {
        let manifest = Manifest::new("T", "A", "D", "1.0");
        let grants = grants(&registry(), &manifest).unwrap();
        assert!(matches!(grants.require::<Db>(), Err(RequireError::Denied(_))));
        assert!(matches!(
            grants.require_named("http"),
            Err(RequireError::Denied(CapabilityDenied { capability: CapabilityName::Http, .. }))
        ));
        assert_eq!(
            grants.require_named("sql").unwrap_err(),
            RequireError::Unknown("sql".into())
        );
    }

    #[test]
    fn unprovided_module_rejects_at_bind() {
        let manifest = Manifest::new("T", "A", "D", "1.0").with_modules(["ws"]);
        let err = grants(&registry(), &manifest).err().unwrap();
        assert!(matches!(err, HostError::UnknownModule { ref module, .. } if module == "ws"));
    }

    #[test]
    fn repeated_lookups_share_the_namespace() {
        let manifest = Manifest::new("T", "A", "D", "1.0").with_modules(["db"]);
        let grants = grants(&registry(), &manifest).unwrap();
        let first = grants.require_named("db").unwrap();
        let second = grants.require_named("db").unwrap();
        assert!(first.same_namespace(&second));
        assert!(first.downcast::<Db>().is_some());
        assert!(first.downcast::<Clock>().is_none());
    }

    #[test]
    fn withheld_module_is_no_longer_provided() {
        let mut registry = registry();
        assert!(registry.withhold(CapabilityName::Db));
        assert!(!registry.provides(CapabilityName::Db));
        assert_eq!(registry.names(), vec![CapabilityName::Helpers]);
    }
}
