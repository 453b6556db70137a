//! The script host.
//!
//! [`ScriptHost`] owns every registered script and drives them from a single
//! queue. Nothing inside a script runs concurrently with anything else in the
//! same host: starts, event handlers and completions all happen on whichever
//! task is calling `pump`, `step` or `run`.

use std::{
    any::Any,
    collections::HashSet,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use anyhow::Result;
use scriptbot_plugin_sdk::{Manifest, ManifestError, ScriptConfig};
use semver::{Version, VersionReq};
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    capabilities::{
        self,
        backend::{ChatBackend, LoopbackBackend},
        engine::ConfigStore,
        event,
        player::Player,
        store::KvStore,
        Services,
    },
    config::HostConfig,
    dispatch::{Delivery, EventHub, Listeners, Outbox},
    error::HostError,
    plugin::{PluginState, ScriptContext, ScriptId, ScriptMain},
    registry::{Binding, CapabilityRegistry},
};

/// An event handed to the host from outside, e.g. a chat line.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub name: String,
    pub payload: Value,
}

impl InboundEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// A script the host refused or that failed while starting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub script: String,
    pub reason: String,
}

/// Summary of one registered script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSummary {
    pub id: ScriptId,
    pub name: String,
    pub version: String,
    pub state: PluginState,
}

struct ScriptSlot {
    manifest: Arc<Manifest>,
    state: PluginState,
    main: Box<dyn ScriptMain>,
    listeners: Arc<Listeners>,
    generation: Arc<AtomicU64>,
    cx: Option<ScriptContext>,
}

impl ScriptSlot {
    /// Drops listeners and invalidates outstanding completions.
    fn reset(&mut self) {
        self.listeners.clear();
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

pub struct HostBuilder {
    config: HostConfig,
    backend: Option<Arc<dyn ChatBackend>>,
    hub: Option<EventHub>,
}

impl HostBuilder {
    /// Server connection scripts talk through; defaults to a
    /// [`LoopbackBackend`].
    pub fn backend(mut self, backend: Arc<dyn ChatBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Joins a hub shared with other hosts so `event.broadcast` reaches them.
    pub fn hub(mut self, hub: EventHub) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn build(self) -> Result<ScriptHost> {
        let config = self.config;
        config.validate()?;
        let host_version = config.host_version()?;

        let kv = match &config.store.path {
            Some(path) => KvStore::open(path)?,
            None => KvStore::in_memory(),
        };
        let backend: Arc<dyn ChatBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(LoopbackBackend::new(config.host.backend, config.host.nick.clone())),
        };
        let services = Services {
            kv: Arc::new(kv),
            configs: ConfigStore::new(config.scripts.config.clone()),
            backend,
            player: Arc::new(Player::new()),
        };

        let mut registry = CapabilityRegistry::new();
        capabilities::install_defaults(&mut registry, &config, &services);
        for name in config.withheld()? {
            registry.withhold(name);
            tracing::info!(module = %name, "protected module withheld by configuration");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let hub = self.hub.unwrap_or_default();
        hub.attach(tx.clone());

        Ok(ScriptHost {
            config,
            host_version,
            registry,
            configs: services.configs,
            slots: Vec::new(),
            rejections: Vec::new(),
            tx,
            rx,
            hub,
        })
    }
}

pub struct ScriptHost {
    config: HostConfig,
    host_version: Version,
    registry: CapabilityRegistry,
    configs: ConfigStore,
    slots: Vec<ScriptSlot>,
    rejections: Vec<Rejection>,
    tx: UnboundedSender<Delivery>,
    rx: UnboundedReceiver<Delivery>,
    hub: EventHub,
}

impl ScriptHost {
    pub fn new(config: HostConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: HostConfig) -> HostBuilder {
        HostBuilder {
            config,
            backend: None,
            hub: None,
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Lets an embedder provide extra modules before scripts are loaded.
    pub fn registry_mut(&mut self) -> &mut CapabilityRegistry {
        &mut self.registry
    }

    /// Configuration stored for `script`, as the next start will see it.
    pub fn stored_config(&self, script: &str) -> Value {
        self.configs.get(script)
    }

    pub fn rejections(&self) -> &[Rejection] {
        &self.rejections
    }

    pub fn state(&self, id: ScriptId) -> Option<PluginState> {
        self.slots.get(id.0).map(|slot| slot.state)
    }

    pub fn find(&self, name: &str) -> Option<ScriptId> {
        self.slots
            .iter()
            .position(|slot| slot.manifest.name == name)
            .map(ScriptId)
    }

    pub fn scripts(&self) -> Vec<ScriptSummary> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| ScriptSummary {
                id: ScriptId(index),
                name: slot.manifest.name.clone(),
                version: slot.manifest.version.clone(),
                state: slot.state,
            })
            .collect()
    }

    /// Context of a loaded script, for embedders that drive it directly.
    pub fn context(&self, id: ScriptId) -> Option<&ScriptContext> {
        self.slots.get(id.0)?.cx.as_ref()
    }

    /// Validates `manifest` and registers `main` under it.
    pub fn register_plugin<M>(&mut self, manifest: Manifest, main: M) -> Result<ScriptId, ManifestError>
    where
        M: ScriptMain,
    {
        let validated = manifest.validate().and_then(|()| {
            if self.find(&manifest.name).is_some() {
                Err(ManifestError::Duplicate(manifest.name.clone()))
            } else {
                Ok(())
            }
        });
        if let Err(err) = validated {
            let script = if manifest.name.trim().is_empty() {
                "<unnamed>".to_string()
            } else {
                manifest.name.clone()
            };
            tracing::warn!(script = %script, error = %err, "script rejected at registration");
            metrics::counter!("scriptbot_scripts_total", "outcome" => "rejected").increment(1);
            self.rejections.push(Rejection {
                script,
                reason: err.to_string(),
            });
            return Err(err);
        }

        let id = ScriptId(self.slots.len());
        tracing::info!(script = %manifest.name, version = %manifest.version, id = %id, "script registered");
        metrics::counter!("scriptbot_scripts_total", "outcome" => "registered").increment(1);
        self.slots.push(ScriptSlot {
            manifest: Arc::new(manifest),
            state: PluginState::Validated,
            main: Box::new(main),
            listeners: Arc::new(Listeners::default()),
            generation: Arc::new(AtomicU64::new(0)),
            cx: None,
        });
        Ok(id)
    }

    /// Everything `load` would check, without registering the script.
    pub fn check(&self, manifest: &Manifest) -> Result<(), HostError> {
        manifest.validate()?;
        self.check_engine(manifest)?;
        let backend = self.config.host.backend;
        if !manifest.supports_backend(backend) {
            return Err(HostError::UnsupportedBackend {
                script: manifest.name.clone(),
                backend: backend.to_string(),
            });
        }
        self.registry.check(manifest)
    }

    fn check_engine(&self, manifest: &Manifest) -> Result<(), HostError> {
        let Some(range) = manifest.engine.as_deref() else {
            return Ok(());
        };
        let required = VersionReq::parse(range.trim()).map_err(|err| HostError::InvalidEngineRange {
            script: manifest.name.clone(),
            range: range.to_string(),
            reason: err.to_string(),
        })?;
        // A pre-release host satisfies plain ranges through its release part.
        let wants_pre = required.comparators.iter().any(|c| !c.pre.is_empty());
        let candidate = if wants_pre {
            self.host_version.clone()
        } else {
            Version::new(
                self.host_version.major,
                self.host_version.minor,
                self.host_version.patch,
            )
        };
        if required.matches(&candidate) {
            Ok(())
        } else {
            Err(HostError::EngineUnsatisfied {
                script: manifest.name.clone(),
                required: range.to_string(),
                host: self.host_version.to_string(),
            })
        }
    }

    /// Resolves the script against this host and binds its modules.
    pub fn load(&mut self, id: ScriptId) -> Result<(), HostError> {
        let index = self.expect_state(id, &[PluginState::Validated], PluginState::Loaded)?;
        let manifest = self.slots[index].manifest.clone();

        let bound = self.check(&manifest).and_then(|()| {
            let slot = &self.slots[index];
            let outbox = Outbox::new(id, slot.generation.clone(), self.tx.clone(), self.hub.clone());
            self.registry.bind(&Binding {
                script: id,
                manifest: &manifest,
                outbox: &outbox,
                listeners: &slot.listeners,
            })
        });

        match bound {
            Ok(grants) => {
                tracing::info!(script = %manifest.name, granted = ?grants.granted(), "script loaded");
                let slot = &mut self.slots[index];
                slot.cx = Some(ScriptContext::new(id, manifest, Arc::new(grants)));
                slot.state = PluginState::Loaded;
                Ok(())
            }
            Err(err) => {
                tracing::warn!(script = %manifest.name, error = %err, "script rejected at load");
                metrics::counter!("scriptbot_scripts_total", "outcome" => "rejected").increment(1);
                self.slots[index].state = PluginState::Rejected;
                self.rejections.push(Rejection {
                    script: manifest.name.clone(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Runs the script's entry point with its stored configuration.
    pub fn start(&mut self, id: ScriptId) -> Result<(), HostError> {
        let index = self.expect_state(id, &[PluginState::Loaded], PluginState::Running)?;
        self.run_main(index, PluginState::Running)
    }

    /// Drops the script's listeners and pending completions, then runs its
    /// entry point again with freshly stored configuration.
    pub fn reload(&mut self, id: ScriptId) -> Result<(), HostError> {
        let index = self.expect_state(
            id,
            &[PluginState::Running, PluginState::Reloaded],
            PluginState::Reloaded,
        )?;
        self.slots[index].reset();
        self.run_main(index, PluginState::Reloaded)
    }

    pub fn unload(&mut self, id: ScriptId) -> Result<(), HostError> {
        let index = self.expect_state(
            id,
            &[PluginState::Loaded, PluginState::Running, PluginState::Reloaded],
            PluginState::Unloaded,
        )?;
        let slot = &mut self.slots[index];
        slot.reset();
        slot.cx = None;
        slot.state = PluginState::Unloaded;
        tracing::info!(script = %slot.manifest.name, "script unloaded");
        metrics::counter!("scriptbot_scripts_total", "outcome" => "unloaded").increment(1);
        Ok(())
    }

    /// Loads and starts every enabled script, then fires `load`. Returns how
    /// many scripts are running afterwards.
    pub fn start_all(&mut self) -> usize {
        let enabled: HashSet<&str> = self.config.scripts.enabled.iter().map(String::as_str).collect();
        let pending: Vec<ScriptId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state == PluginState::Validated)
            .filter(|(_, slot)| slot.manifest.autorun || enabled.contains(slot.manifest.name.as_str()))
            .map(|(index, _)| ScriptId(index))
            .collect();

        let mut started = 0;
        for id in pending {
            // Failures are logged and recorded by load/start.
            if self.load(id).is_ok() && self.start(id).is_ok() {
                started += 1;
            }
        }
        tracing::info!(started, registered = self.slots.len(), "scripts started");
        self.dispatch(event::LOAD, &Value::Null);
        started
    }

    pub fn reload_all(&mut self) -> usize {
        let live: Vec<ScriptId> = self.live_ids();
        let mut reloaded = 0;
        for id in live {
            if self.reload(id).is_ok() {
                reloaded += 1;
            }
        }
        reloaded
    }

    /// Fires `unload` and unloads every script still holding bindings.
    pub fn shutdown(&mut self) {
        self.dispatch(event::UNLOAD, &Value::Null);
        let loaded: Vec<ScriptId> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_live() || slot.state == PluginState::Loaded)
            .map(|(index, _)| ScriptId(index))
            .collect();
        for id in loaded {
            if let Err(err) = self.unload(id) {
                tracing::warn!(script = %id, error = %err, "failed to unload script");
            }
        }
    }

    /// Runs every live listener for `name` right away. Returns the number of
    /// handlers invoked.
    pub fn dispatch(&mut self, name: &str, payload: &Value) -> usize {
        metrics::counter!("scriptbot_events_total").increment(1);
        let mut invoked = 0;
        for slot in self.slots.iter_mut().filter(|slot| slot.state.is_live()) {
            let Some(cx) = slot.cx.as_mut() else {
                continue;
            };
            let mut handlers = slot.listeners.take(name);
            for handler in handlers.iter_mut() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut *cx, payload)));
                if let Err(panic) = outcome {
                    tracing::error!(
                        script = %slot.manifest.name,
                        event = name,
                        panic = %panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
                invoked += 1;
            }
            slot.listeners.restore(name, handlers);
        }
        invoked
    }

    /// Queues `name` as if a script had emitted it.
    pub fn emit(&self, name: &str, payload: Value) {
        self.tx
            .send(Delivery::Event {
                name: name.to_string(),
                payload,
            })
            .ok();
    }

    /// Processes every delivery that is ready without waiting. Returns how
    /// many were processed.
    pub fn pump(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(delivery) = self.rx.try_recv() {
            self.process(delivery);
            processed += 1;
        }
        processed
    }

    /// Waits for the next delivery and processes it.
    pub async fn step(&mut self) {
        // The host keeps its own sender alive, so the queue never closes.
        if let Some(delivery) = self.rx.recv().await {
            self.process(delivery);
        }
    }

    /// Starts every enabled script and processes inbound events and queued
    /// deliveries until `shutdown` resolves or `inbound` closes, then shuts
    /// the scripts down.
    pub async fn run<F>(&mut self, mut inbound: mpsc::Receiver<InboundEvent>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.start_all();
        self.pump();

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received; unloading scripts");
                    break;
                }
                delivery = self.rx.recv() => match delivery {
                    Some(delivery) => self.process(delivery),
                    None => break,
                },
                event = inbound.recv() => match event {
                    Some(event) => {
                        self.dispatch(&event.name, &event.payload);
                    }
                    None => {
                        tracing::info!("inbound events closed; unloading scripts");
                        self.pump();
                        break;
                    }
                },
            }
        }

        self.shutdown();
        Ok(())
    }

    fn process(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::Event { name, payload } => {
                self.dispatch(&name, &payload);
            }
            Delivery::Completion {
                script,
                generation,
                job,
            } => {
                let Some(slot) = self.slots.get_mut(script.0) else {
                    return;
                };
                let current = slot.generation.load(Ordering::Acquire);
                if !slot.state.is_live() || current != generation {
                    tracing::debug!(script = %slot.manifest.name, generation, current, "stale completion dropped");
                    return;
                }
                let Some(cx) = slot.cx.as_mut() else {
                    return;
                };
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || job(cx))) {
                    tracing::error!(
                        script = %slot.manifest.name,
                        panic = %panic_message(panic.as_ref()),
                        "completion callback panicked"
                    );
                }
            }
            Delivery::ReloadAll => {
                let reloaded = self.reload_all();
                tracing::info!(reloaded, "scripts reloaded on request");
            }
        }
    }

    fn live_ids(&self) -> Vec<ScriptId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state.is_live())
            .map(|(index, _)| ScriptId(index))
            .collect()
    }

    fn expect_state(&self, id: ScriptId, from: &[PluginState], to: PluginState) -> Result<usize, HostError> {
        let slot = self.slots.get(id.0).ok_or(HostError::UnknownScript(id))?;
        if from.contains(&slot.state) {
            Ok(id.0)
        } else {
            Err(HostError::InvalidTransition {
                script: slot.manifest.name.clone(),
                from: slot.state,
                to,
            })
        }
    }

    fn run_main(&mut self, index: usize, to: PluginState) -> Result<(), HostError> {
        let slot = &mut self.slots[index];
        let name = slot.manifest.name.clone();

        let config = if slot.manifest.hidden {
            Ok(ScriptConfig::empty())
        } else {
            slot.manifest
                .schema()
                .resolve(&self.configs.get(&name))
                .map_err(|source| HostError::Config {
                    script: name.clone(),
                    source,
                })
        };

        let outcome = config.and_then(|config| {
            let Some(cx) = slot.cx.as_mut() else {
                return Err(HostError::StartFailed {
                    script: name.clone(),
                    reason: "script has no bindings".into(),
                });
            };
            let manifest = slot.manifest.clone();
            let main = &mut slot.main;
            match panic::catch_unwind(AssertUnwindSafe(|| main.main(cx, &config, &manifest))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(HostError::StartFailed {
                    script: name.clone(),
                    reason: format!("{err:#}"),
                }),
                Err(panic) => Err(HostError::StartFailed {
                    script: name.clone(),
                    reason: format!("panicked: {}", panic_message(panic.as_ref())),
                }),
            }
        });

        match outcome {
            Ok(()) => {
                slot.state = to;
                let label = if to == PluginState::Reloaded { "reloaded" } else { "started" };
                tracing::info!(script = %name, state = %to, "script {label}");
                metrics::counter!("scriptbot_scripts_total", "outcome" => label).increment(1);
                Ok(())
            }
            Err(err) => {
                slot.reset();
                slot.cx = None;
                slot.state = PluginState::Failed;
                tracing::error!(script = %name, error = %err, "script failed");
                metrics::counter!("scriptbot_scripts_total", "outcome" => "failed").increment(1);
                self.rejections.push(Rejection {
                    script: name,
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
