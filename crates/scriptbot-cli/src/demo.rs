//! The bundled `echo` script and the console backend `scriptbot run` uses.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use scriptbot_core::{
    capabilities::{backend::ChatBackend, event, Backend, Engine, Event, Format, Store},
    ScriptContext, ScriptMain,
};
use scriptbot_plugin_sdk::{BackendKind, Manifest, ScriptConfig, VarDescriptor, VarKind};
use serde_json::{json, Value};

pub fn echo_manifest() -> Manifest {
    Manifest::new(
        "echo",
        "scriptbot",
        "Repeats every chat message and counts them per instance",
        "1.0.0",
    )
    .autorun()
    .with_engine(">=0.1.0")
    .with_vars(vec![
        VarDescriptor::new("prefix", VarKind::String).with_default(json!("echo: ")),
        VarDescriptor::new("style", VarKind::Select)
            .with_options(["plain", "bold"])
            .with_default(json!(0)),
    ])
}

pub fn echo_main() -> impl ScriptMain {
    |cx: &mut ScriptContext, config: &ScriptConfig, _: &Manifest| -> anyhow::Result<()> {
        let prefix = config.text("prefix").unwrap_or_default().to_string();
        let bold = matches!(config.choice("style"), Some((1, _)));
        cx.require::<Engine>()?.log(format!("echo ready (prefix {prefix:?})"));

        let events = cx.require::<Event>()?;
        events.on(event::CHAT, move |cx, payload| {
            if let Err(err) = reply(cx, payload, &prefix, bold) {
                tracing::warn!(script = cx.name(), error = %err, "echo failed");
            }
        });
        events.on(event::UNLOAD, |cx, _| {
            if let Ok(backend) = cx.require::<Backend>() {
                backend.chat("echo signing off");
            }
        });
        Ok(())
    }
}

fn reply(cx: &mut ScriptContext, payload: &Value, prefix: &str, bold: bool) -> anyhow::Result<()> {
    let text = payload["text"].as_str().unwrap_or_default().trim();
    if text.is_empty() {
        return Ok(());
    }
    let store = cx.require::<Store>()?;
    let count = store.instance().get_as::<u64>("count").unwrap_or(0) + 1;
    store.instance().set("count", &count)?;

    let backend = cx.require::<Backend>()?;
    if text == "!count" {
        backend.chat(&format!("{count} messages so far"));
        return Ok(());
    }
    let message = format!("{prefix}{text}");
    let message = if bold {
        cx.require::<Format>()?.bold(&message)
    } else {
        message
    };
    backend.chat(&message);
    Ok(())
}

/// Prints chat output on stdout.
pub struct ConsoleBackend {
    kind: BackendKind,
    connected: AtomicBool,
    nick: Mutex<String>,
}

impl ConsoleBackend {
    pub fn new(kind: BackendKind, nick: impl Into<String>) -> Self {
        Self {
            kind,
            connected: AtomicBool::new(true),
            nick: Mutex::new(nick.into()),
        }
    }
}

impl ChatBackend for ConsoleBackend {
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
        println!("<{}> {text}", self.nick());
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use scriptbot_core::{
        capabilities::backend::LoopbackBackend, HostConfig, PluginState, ScriptHost,
    };

    use super::*;

    #[test]
    fn echo_manifest_is_valid() {
        echo_manifest().validate().unwrap();
    }

    #[test]
    fn echo_repeats_and_counts() {
        let mut config = HostConfig::default();
        config
            .scripts
            .config
            .insert("echo".into(), json!({"prefix": "> ", "style": "bold"}));
        let backend = Arc::new(LoopbackBackend::new(BackendKind::Ts3, "bot"));
        let mut host = ScriptHost::builder(config)
            .backend(backend.clone())
            .build()
            .unwrap();
        let id = host.register_plugin(echo_manifest(), echo_main()).unwrap();
        assert_eq!(host.start_all(), 1);
        assert_eq!(host.state(id), Some(PluginState::Running));

        host.dispatch(event::CHAT, &json!({"text": "hi"}));
        host.dispatch(event::CHAT, &json!({"text": "   "}));
        host.dispatch(event::CHAT, &json!({"text": "!count"}));
        host.shutdown();

        assert_eq!(
            backend.transcript(),
            vec!["[b]> hi[/b]", "2 messages so far", "echo signing off"]
        );
    }
}
