//! Modules scripts can `require`, and the marker types that name them.

pub mod backend;
pub mod crypto;
pub mod db;
pub mod engine;
pub mod event;
pub mod format;
pub mod fs;
pub mod helpers;
pub mod http;
pub mod net;
pub mod player;
pub mod store;

use std::sync::{atomic::AtomicU8, Arc};

use scriptbot_plugin_sdk::CapabilityName;

use self::{
    backend::{BackendNamespace, ChatBackend},
    crypto::CryptoNamespace,
    db::DbNamespace,
    engine::{ConfigStore, EngineNamespace, EngineShared},
    event::EventNamespace,
    format::FormatNamespace,
    fs::FsNamespace,
    helpers::HelpersNamespace,
    http::{HttpLimits, HttpNamespace},
    net::NetNamespace,
    player::{AudioNamespace, MediaNamespace, Player},
    store::{KvStore, StoreNamespace},
};
use crate::{
    config::HostConfig,
    registry::{Binding, Capability, CapabilityRegistry},
};

macro_rules! capability {
    ($(#[$doc:meta])* $marker:ident => $name:ident, $namespace:ty) => {
        $(#[$doc])*
        pub struct $marker;

        impl Capability for $marker {
            const NAME: CapabilityName = CapabilityName::$name;
            type Namespace = $namespace;
        }
    };
}

capability!(Engine => Engine, EngineNamespace);
capability!(Event => Event, EventNamespace);
capability!(Store => Store, StoreNamespace);
capability!(Format => Format, FormatNamespace);
capability!(Helpers => Helpers, HelpersNamespace);
capability!(Backend => Backend, BackendNamespace);
capability!(Audio => Audio, AudioNamespace);
capability!(Media => Media, MediaNamespace);
capability!(
    /// Protected: outgoing HTTP requests.
    Http => Http, HttpNamespace
);
capability!(
    /// Protected: files under the host's sandbox root.
    Fs => Fs, FsNamespace
);
capability!(
    /// Protected: randomness, key derivation and authenticated encryption.
    Crypto => Crypto, CryptoNamespace
);
capability!(
    /// Protected: SQLite databases.
    Db => Db, DbNamespace
);
capability!(
    /// Protected: raw TCP connections.
    Net => Net, NetNamespace
);

/// Host-wide state the default namespaces are built from.
pub(crate) struct Services {
    pub(crate) kv: Arc<KvStore>,
    pub(crate) configs: ConfigStore,
    pub(crate) backend: Arc<dyn ChatBackend>,
    pub(crate) player: Arc<Player>,
}

/// Installs every module this host implements. Unprotected ones are always
/// present; protected ones can be withheld afterwards.
pub(crate) fn install_defaults(
    registry: &mut CapabilityRegistry,
    config: &HostConfig,
    services: &Services,
) {
    let shared = Arc::new(EngineShared {
        instance_id: config.host.instance_id.clone(),
        bot_id: config.host.bot_id.clone(),
        allow_reload: config.host.allow_reload,
        instance_log_level: AtomicU8::new(engine::MAX_LOG_LEVEL / 2),
        bot_log_level: AtomicU8::new(engine::MAX_LOG_LEVEL / 2),
        configs: services.configs.clone(),
        backend: services.backend.clone(),
    });
    registry.provide::<Engine, _>(move |binding: &Binding<'_>| {
        EngineNamespace::new(
            binding.manifest.name.clone(),
            binding.manifest.hidden,
            binding.manifest.schema(),
            shared.clone(),
            binding.outbox.clone(),
        )
    });

    registry.provide::<Event, _>(|binding: &Binding<'_>| {
        EventNamespace::new(binding.listeners.clone(), binding.outbox.clone())
    });

    let kv = services.kv.clone();
    let instance = config.host.instance_id.clone();
    registry.provide::<Store, _>(move |binding: &Binding<'_>| {
        StoreNamespace::new(kv.clone(), &instance, &binding.manifest.name)
    });

    registry.provide_shared::<Format>(Arc::new(FormatNamespace::new(services.backend.kind())));
    registry.provide_shared::<Helpers>(Arc::new(HelpersNamespace));
    registry.provide_shared::<Backend>(Arc::new(BackendNamespace::new(services.backend.clone())));
    registry.provide_shared::<Audio>(Arc::new(AudioNamespace::new(services.player.clone())));
    registry.provide_shared::<Media>(Arc::new(MediaNamespace::new(services.player.clone())));

    let client = http::build_client();
    let limits = HttpLimits {
        timeout: config.http_timeout(),
        max_body_bytes: config.http.max_body_bytes,
    };
    registry.provide::<Http, _>(move |binding: &Binding<'_>| {
        HttpNamespace::new(client.clone(), binding.outbox.clone(), limits)
    });

    let connect_timeout = config.http_timeout();
    registry.provide::<Net, _>(move |binding: &Binding<'_>| {
        NetNamespace::new(binding.outbox.clone(), connect_timeout)
    });
    registry.provide::<Db, _>(|binding: &Binding<'_>| DbNamespace::new(binding.outbox.clone()));

    registry.provide_shared::<Fs>(Arc::new(FsNamespace::new(config.fs.root.clone())));
    registry.provide_shared::<Crypto>(Arc::new(CryptoNamespace::default()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::backend::LoopbackBackend;

    #[test]
    fn defaults_cover_every_implemented_module() {
        let config = HostConfig::default();
        let services = Services {
            kv: Arc::new(KvStore::in_memory()),
            configs: ConfigStore::default(),
            backend: Arc::new(LoopbackBackend::new(config.host.backend, "bot")),
            player: Arc::new(Player::new()),
        };
        let mut registry = CapabilityRegistry::new();
        install_defaults(&mut registry, &config, &services);

        for name in CapabilityName::ALL {
            if !name.is_protected() {
                assert!(registry.provides(name), "{name} must always be provided");
            }
        }
        for name in [
            CapabilityName::Http,
            CapabilityName::Fs,
            CapabilityName::Crypto,
            CapabilityName::Db,
            CapabilityName::Net,
        ] {
            assert!(registry.provides(name));
        }
        assert!(!registry.provides(CapabilityName::Ws));
    }
}
