//! Delivery plumbing between namespaces and the host loop.
//!
//! Namespaces never call back into a script directly. They enqueue a
//! [`Delivery`] on the host's queue and the host runs it later, one callback
//! at a time, with the script's own context.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::plugin::{ScriptContext, ScriptId};

pub(crate) type Job = Box<dyn FnOnce(&mut ScriptContext) + Send>;
pub(crate) type Handler = Box<dyn FnMut(&mut ScriptContext, &Value) + Send>;

pub(crate) enum Delivery {
    Event { name: String, payload: Value },
    Completion {
        script: ScriptId,
        generation: u64,
        job: Job,
    },
    ReloadAll,
}

/// Per-script sending side of the host queue.
#[derive(Clone)]
pub struct Outbox {
    script: ScriptId,
    generation: Arc<AtomicU64>,
    tx: UnboundedSender<Delivery>,
    hub: EventHub,
}

impl Outbox {
    pub(crate) fn new(
        script: ScriptId,
        generation: Arc<AtomicU64>,
        tx: UnboundedSender<Delivery>,
        hub: EventHub,
    ) -> Self {
        Self {
            script,
            generation,
            tx,
            hub,
        }
    }

    pub fn script(&self) -> ScriptId {
        self.script
    }

    /// Reserves a completion slot for the script's current generation.
    /// Completions from a generation that has since been reloaded are dropped.
    pub(crate) fn ticket(&self) -> Ticket {
        Ticket {
            script: self.script,
            generation: self.generation.load(Ordering::Acquire),
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn emit(&self, name: &str, payload: Value) {
        let delivery = Delivery::Event {
            name: name.to_string(),
            payload,
        };
        if self.tx.send(delivery).is_err() {
            tracing::debug!(script = %self.script, event = name, "host queue closed; event dropped");
        }
    }

    pub(crate) fn broadcast(&self, name: &str, payload: Value) {
        self.hub.publish(name, payload);
    }

    pub(crate) fn request_reload(&self) {
        self.tx.send(Delivery::ReloadAll).ok();
    }
}

pub(crate) struct Ticket {
    script: ScriptId,
    generation: u64,
    tx: UnboundedSender<Delivery>,
}

impl Ticket {
    pub(crate) fn complete<F>(self, job: F)
    where
        F: FnOnce(&mut ScriptContext) + Send + 'static,
    {
        let delivery = Delivery::Completion {
            script: self.script,
            generation: self.generation,
            job: Box::new(job),
        };
        if self.tx.send(delivery).is_err() {
            tracing::debug!(script = %self.script, "host queue closed; completion dropped");
        }
    }
}

/// Fan-out point for `event.broadcast`. Every host attached to the same hub
/// receives broadcast events on its own queue.
#[derive(Clone, Default)]
pub struct EventHub {
    hosts: Arc<Mutex<Vec<UnboundedSender<Delivery>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn attach(&self, tx: UnboundedSender<Delivery>) {
        self.hosts.lock().push(tx);
    }

    pub(crate) fn publish(&self, name: &str, payload: Value) {
        let mut hosts = self.hosts.lock();
        hosts.retain(|tx| {
            tx.send(Delivery::Event {
                name: name.to_string(),
                payload: payload.clone(),
            })
            .is_ok()
        });
    }

    pub fn attached(&self) -> usize {
        self.hosts.lock().len()
    }
}

/// Event handlers registered by one script.
#[derive(Default)]
pub(crate) struct Listeners {
    by_event: Mutex<HashMap<String, Vec<Handler>>>,
}

impl Listeners {
    pub(crate) fn add(&self, event: &str, handler: Handler) {
        self.by_event
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Removes the handlers for `event` so they can run without holding the
    /// lock; handlers may register new listeners while running.
    pub(crate) fn take(&self, event: &str) -> Vec<Handler> {
        self.by_event.lock().remove(event).unwrap_or_default()
    }

    /// Puts handlers back ahead of any registered while they were out.
    pub(crate) fn restore(&self, event: &str, mut handlers: Vec<Handler>) {
        let mut by_event = self.by_event.lock();
        let slot = by_event.entry(event.to_string()).or_default();
        handlers.append(slot);
        *slot = handlers;
    }

    pub(crate) fn clear(&self) {
        self.by_event.lock().clear();
    }

    pub(crate) fn count(&self, event: &str) -> usize {
        self.by_event.lock().get(event).map_or(0, Vec::len)
    }
}
