use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;
use scriptbot_plugin_sdk::BackendKind;

/// Connection to the chat server the bot lives on. The host only needs a
/// handful of operations; the wire protocol is the implementor's business.
pub trait ChatBackend: Send + Sync {
    fn kind(&self) -> BackendKind;
    fn connect(&self) -> bool;
    fn disconnect(&self) -> bool;
    fn is_connected(&self) -> bool;
    fn nick(&self) -> String;
    fn set_nick(&self, nick: &str) -> bool;
    /// Sends a message to the server chat.
    fn chat(&self, text: &str) -> bool;
}

/// In-process backend that records what scripts send. Used when no real
/// server connection is configured.
pub struct LoopbackBackend {
    kind: BackendKind,
    connected: AtomicBool,
    nick: Mutex<String>,
    transcript: Mutex<Vec<String>>,
}

impl LoopbackBackend {
    pub fn new(kind: BackendKind, nick: impl Into<String>) -> Self {
        Self {
            kind,
            connected: AtomicBool::new(true),
            nick: Mutex::new(nick.into()),
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn transcript(&self) -> Vec<String> {
        self.transcript.lock().clone()
    }
}

impl ChatBackend for LoopbackBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn connect(&self) -> bool {
        !self.connected.swap(true, Ordering::AcqRel)
    }

    fn disconnect(&self) -> bool {
        self.connected.swap(false, Ordering::AcqRel)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn nick(&self) -> String {
        self.nick.lock().clone()
    }

    fn set_nick(&self, nick: &str) -> bool {
        if nick.trim().is_empty() {
            return false;
        }
        *self.nick.lock() = nick.to_string();
        true
    }

    fn chat(&self, text: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        tracing::info!(backend = %self.kind, nick = %self.nick(), "{text}");
        self.transcript.lock().push(text.to_string());
        true
    }
}

/// The `backend` module.
pub struct BackendNamespace {
    inner: Arc<dyn ChatBackend>,
}

impl BackendNamespace {
    pub(crate) fn new(inner: Arc<dyn ChatBackend>) -> Self {
        Self { inner }
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.kind()
    }

    pub fn connect(&self) -> bool {
        self.inner.connect()
    }

    pub fn disconnect(&self) -> bool {
        self.inner.disconnect()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn nick(&self) -> String {
        self.inner.nick()
    }

    pub fn chat(&self, text: &str) -> bool {
        self.inner.chat(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_loopback_refuses_chat() {
        let backend = LoopbackBackend::new(BackendKind::Ts3, "bot");
        assert!(backend.chat("hello"));
        assert!(backend.disconnect());
        assert!(!backend.disconnect());
        assert!(!backend.chat("lost"));
        assert!(backend.connect());
        assert_eq!(backend.transcript(), vec!["hello"]);
    }

    #[test]
    fn blank_nick_is_ignored() {
        let backend = LoopbackBackend::new(BackendKind::Discord, "bot");
        assert!(!backend.set_nick("  "));
        assert!(backend.set_nick("helper"));
        assert_eq!(backend.nick(), "helper");
    }
}
