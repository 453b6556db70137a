use std::sync::Arc;

use serde_json::Value;

use crate::{
    dispatch::{Listeners, Outbox},
    plugin::ScriptContext,
};

/// Fired once by `start_all` after every enabled script has started.
pub const LOAD: &str = "load";
/// Fired by `shutdown` before scripts are unloaded.
pub const UNLOAD: &str = "unload";
/// A chat message arrived; the payload carries `text` and `client`.
pub const CHAT: &str = "chat";

/// The `event` module.
pub struct EventNamespace {
    listeners: Arc<Listeners>,
    outbox: Outbox,
}

impl EventNamespace {
    pub(crate) fn new(listeners: Arc<Listeners>, outbox: Outbox) -> Self {
        Self { listeners, outbox }
    }

    /// Registers `handler` for `event`. Handlers run on the host loop with the
    /// script's own context and are dropped when the script reloads.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: FnMut(&mut ScriptContext, &Value) + Send + 'static,
    {
        self.listeners.add(event, Box::new(handler));
    }

    /// Queues `event` for every script on this host.
    pub fn emit(&self, event: &str, data: Value) {
        self.outbox.emit(event, data);
    }

    /// Queues `event` for every script on every host sharing this host's hub.
    pub fn broadcast(&self, event: &str, data: Value) {
        self.outbox.broadcast(event, data);
    }
}
