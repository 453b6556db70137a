//! Key-value store behind the `store` module.
//!
//! All scopes live in one [`KvStore`]; a [`ScopedStore`] only knows which
//! scope key it writes under. When a persistence file is configured every
//! write is flushed to it before returning.

use std::{
    collections::{BTreeMap, HashMap},
    fs,
    marker::PhantomData,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use parking_lot::RwLock;
use scriptbot_plugin_sdk::{OperationError, OperationErrorKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScopeKey {
    Script { script: String },
    Global,
    Instance { instance: String, script: String },
}

#[derive(Serialize, Deserialize)]
struct StoredScope {
    scope: ScopeKey,
    values: BTreeMap<String, Value>,
}

type Scopes = HashMap<ScopeKey, BTreeMap<String, Value>>;

pub struct KvStore {
    scopes: RwLock<Scopes>,
    path: Option<PathBuf>,
}

impl KvStore {
    pub fn in_memory() -> Self {
        Self {
            scopes: RwLock::new(HashMap::new()),
            path: None,
        }
    }

    /// Opens a store persisted at `path`, loading previous contents if the
    /// file exists. Missing parent directories are created.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create store directory {}", parent.display()))?;
        }
        let scopes = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read store {}", path.display()))?;
            let stored: Vec<StoredScope> = serde_json::from_str(&raw)
                .with_context(|| format!("store {} is not valid JSON", path.display()))?;
            stored
                .into_iter()
                .map(|entry| (entry.scope, entry.values))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            scopes: RwLock::new(scopes),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn get(&self, scope: &ScopeKey, key: &str) -> Option<Value> {
        self.scopes.read().get(scope)?.get(key).cloned()
    }

    fn set(&self, scope: &ScopeKey, key: &str, value: Value) -> Result<(), OperationError> {
        let mut scopes = self.scopes.write();
        let previous = scopes
            .entry(scope.clone())
            .or_default()
            .insert(key.to_string(), value);
        self.persist(&scopes).inspect_err(|_| {
            restore(&mut scopes, scope, key, previous);
        })
    }

    fn unset(&self, scope: &ScopeKey, key: &str) -> Result<bool, OperationError> {
        let mut scopes = self.scopes.write();
        let Some(previous) = scopes.get_mut(scope).and_then(|values| values.remove(key)) else {
            return Ok(false);
        };
        self.persist(&scopes).inspect_err(|_| {
            restore(&mut scopes, scope, key, Some(previous));
        })?;
        Ok(true)
    }

    fn keys(&self, scope: &ScopeKey) -> Vec<String> {
        self.scopes
            .read()
            .get(scope)
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn all(&self, scope: &ScopeKey) -> BTreeMap<String, Value> {
        self.scopes.read().get(scope).cloned().unwrap_or_default()
    }

    // Called with the write lock held so the file matches the last write.
    fn persist(&self, scopes: &Scopes) -> Result<(), OperationError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let stored: Vec<StoredScope> = scopes
            .iter()
            .filter(|(_, values)| !values.is_empty())
            .map(|(scope, values)| StoredScope {
                scope: scope.clone(),
                values: values.clone(),
            })
            .collect();
        let body = serde_json::to_vec_pretty(&stored)
            .map_err(|err| OperationError::new(OperationErrorKind::Encoding, err.to_string()))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body).map_err(|err| OperationError::io(&err))?;
        fs::rename(&tmp, path).map_err(|err| OperationError::io(&err))
    }
}

// Undoes an in-memory change whose write to disk failed.
fn restore(scopes: &mut Scopes, scope: &ScopeKey, key: &str, previous: Option<Value>) {
    let values = scopes.entry(scope.clone()).or_default();
    match previous {
        Some(value) => {
            values.insert(key.to_string(), value);
        }
        None => {
            values.remove(key);
        }
    }
}

/// Selects which part of the store a [`ScopedStore`] sees.
pub trait Scope: Send + Sync + 'static {
    fn key(instance: &str, script: &str) -> ScopeKey;
}

/// Shared by every instance running the script.
pub struct ScriptScope;
/// Shared by every script on every instance.
pub struct GlobalScope;
/// This script on this instance only.
pub struct InstanceScope;

impl Scope for ScriptScope {
    fn key(_instance: &str, script: &str) -> ScopeKey {
        ScopeKey::Script {
            script: script.to_string(),
        }
    }
}

impl Scope for GlobalScope {
    fn key(_instance: &str, _script: &str) -> ScopeKey {
        ScopeKey::Global
    }
}

impl Scope for InstanceScope {
    fn key(instance: &str, script: &str) -> ScopeKey {
        ScopeKey::Instance {
            instance: instance.to_string(),
            script: script.to_string(),
        }
    }
}

pub struct ScopedStore<S: Scope> {
    kv: Arc<KvStore>,
    key: ScopeKey,
    _scope: PhantomData<fn() -> S>,
}

impl<S: Scope> ScopedStore<S> {
    pub(crate) fn new(kv: Arc<KvStore>, instance: &str, script: &str) -> Self {
        Self {
            kv,
            key: S::key(instance, script),
            _scope: PhantomData,
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.kv.get(&self.key, key)
    }

    /// Reads `key` as `T`; a value of another shape reads as absent.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        serde_json::from_value(self.get(key)?).ok()
    }

    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), OperationError> {
        let value = serde_json::to_value(value)
            .map_err(|err| OperationError::new(OperationErrorKind::Encoding, err.to_string()))?;
        self.kv.set(&self.key, key, value)
    }

    /// Returns whether the key was present.
    pub fn unset(&self, key: &str) -> Result<bool, OperationError> {
        self.kv.unset(&self.key, key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.kv.keys(&self.key)
    }

    pub fn all(&self) -> BTreeMap<String, Value> {
        self.kv.all(&self.key)
    }
}

/// The `store` module.
pub struct StoreNamespace {
    script: ScopedStore<ScriptScope>,
    global: ScopedStore<GlobalScope>,
    instance: ScopedStore<InstanceScope>,
}

impl StoreNamespace {
    pub(crate) fn new(kv: Arc<KvStore>, instance: &str, script: &str) -> Self {
        Self {
            script: ScopedStore::new(kv.clone(), instance, script),
            global: ScopedStore::new(kv.clone(), instance, script),
            instance: ScopedStore::new(kv, instance, script),
        }
    }

    pub fn script(&self) -> &ScopedStore<ScriptScope> {
        &self.script
    }

    pub fn global(&self) -> &ScopedStore<GlobalScope> {
        &self.global
    }

    pub fn instance(&self) -> &ScopedStore<InstanceScope> {
        &self.instance
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn scopes_are_isolated() {
        let kv = Arc::new(KvStore::in_memory());
        let echo_a = StoreNamespace::new(kv.clone(), "a", "echo");
        let echo_b = StoreNamespace::new(kv.clone(), "b", "echo");
        let other = StoreNamespace::new(kv, "a", "other");

        echo_a.script().set("greeting", "hi").unwrap();
        echo_a.instance().set("count", &3).unwrap();
        echo_a.global().set("motd", "welcome").unwrap();

        assert_eq!(echo_b.script().get("greeting"), Some(json!("hi")));
        assert_eq!(echo_b.instance().get("count"), None);
        assert_eq!(other.script().get("greeting"), None);
        assert_eq!(other.global().get_as::<String>("motd").as_deref(), Some("welcome"));
    }

    #[test]
    fn unset_and_listing() {
        let kv = Arc::new(KvStore::in_memory());
        let store = StoreNamespace::new(kv, "a", "echo");
        store.script().set("b", &2).unwrap();
        store.script().set("a", &1).unwrap();
        assert_eq!(store.script().keys(), vec!["a", "b"]);
        assert!(store.script().unset("a").unwrap());
        assert!(!store.script().unset("a").unwrap());
        assert_eq!(store.script().all().len(), 1);
        assert_eq!(store.script().get_as::<String>("b"), None);
    }

    #[test]
    fn persisted_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let kv = Arc::new(KvStore::open(&path).unwrap());
            let store = StoreNamespace::new(kv, "a", "echo");
            store.instance().set("seen", &json!({"alice": 2})).unwrap();
            store.global().set("x", &1).unwrap();
            store.global().set("x", &2).unwrap();
        }
        let kv = Arc::new(KvStore::open(&path).unwrap());
        let store = StoreNamespace::new(kv, "a", "echo");
        assert_eq!(store.instance().get("seen"), Some(json!({"alice": 2})));
        assert_eq!(store.global().get_as::<u32>("x"), Some(2));
    }

    #[test]
    fn open_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("store.json");
        let kv = Arc::new(KvStore::open(&path).unwrap());
        StoreNamespace::new(kv, "a", "echo").script().set("k", &1).unwrap();
        assert!(path.is_file());
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let kv = Arc::new(KvStore::open(&path).unwrap());
        let store = StoreNamespace::new(kv, "a", "echo");
        store.script().set("k", &1).unwrap();

        // A directory in place of the file makes the final rename fail.
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        assert!(store.script().set("k", &2).is_err());
        assert!(store.script().set("fresh", &3).is_err());
        assert!(store.script().unset("k").is_err());
        assert_eq!(store.script().get_as::<u32>("k"), Some(1));
        assert_eq!(store.script().get("fresh"), None);
        assert_eq!(store.script().keys(), vec!["k"]);
    }
}
