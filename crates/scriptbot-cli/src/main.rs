mod demo;

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use regex::Regex;
use scriptbot_core::{capabilities::event, HostConfig, InboundEvent, ScriptHost};
use scriptbot_plugin_sdk::{CapabilityName, Manifest};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "scriptbot", author, version, about = "Script host for chat bots")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a host with the bundled echo script; each stdin line is a chat message.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = "demos/host.example.toml")]
        config: PathBuf,
    },
    /// Interact with host configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect script manifests.
    Manifest {
        #[command(subcommand)]
        command: ManifestCommands,
    },
    /// Inspect script manifests in a directory.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// List module names scripts can require.
    Capabilities,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints the bundled example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum ManifestCommands {
    /// Checks a manifest; with a host config also checks it would load there.
    Validate {
        #[arg(value_name = "FILE")]
        manifest: PathBuf,
        #[arg(long, value_name = "HOST")]
        config: Option<PathBuf>,
    },
    /// Prints the configuration a script would receive.
    Config {
        #[arg(value_name = "FILE")]
        manifest: PathBuf,
        /// Stored values as a JSON object.
        #[arg(long, value_name = "JSON")]
        values: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists `*.json` manifests in a directory, or in the host's search paths.
    List {
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
        #[arg(short, long, value_name = "FILE", default_value = "demos/host.example.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Run { config } => handle_run(config).await,
        Commands::Config { command } => handle_config(command),
        Commands::Manifest { command } => handle_manifest(command),
        Commands::Plugins { command } => handle_plugins(command),
        Commands::Capabilities => handle_capabilities(),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

async fn handle_run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let dirs = search_dirs(&config_path, &config);
    let backend = Arc::new(demo::ConsoleBackend::new(config.host.backend, config.host.nick.clone()));
    let mut host = ScriptHost::builder(config).backend(backend).build()?;
    host.register_plugin(demo::echo_manifest(), demo::echo_main())?;
    report_manifests(&host, &dirs)?;

    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let event = InboundEvent::new(event::CHAT, json!({ "text": line, "client": "console" }));
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read stdin");
                    break;
                }
            }
        }
    });

    tracing::info!("script host started; type chat messages, Ctrl+C or EOF to stop");
    host.run(rx, async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install ctrl-c handler");
            std::future::pending::<()>().await;
        }
    })
    .await
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => {
            println!("{}", include_str!("../../../demos/host.example.toml"));
        }
    }
    Ok(())
}

fn handle_manifest(command: ManifestCommands) -> Result<()> {
    match command {
        ManifestCommands::Validate { manifest, config } => {
            let parsed = load_manifest(&manifest)?;
            match config {
                Some(config) => {
                    let host = ScriptHost::new(load_config(&config)?)?;
                    host.check(&parsed)
                        .with_context(|| format!("`{}` would not load on this host", parsed.name))?;
                    println!(
                        "manifest OK: {} v{} loads on host {}",
                        parsed.name,
                        parsed.version,
                        host.host_version()
                    );
                }
                None => println!("manifest OK: {} v{}", parsed.name, parsed.version),
            }
        }
        ManifestCommands::Config { manifest, values } => {
            let parsed = load_manifest(&manifest)?;
            let raw = match values {
                Some(values) => serde_json::from_str::<Value>(&values).context("--values is not valid JSON")?,
                None => Value::Null,
            };
            let resolved = parsed
                .schema()
                .resolve(&raw)
                .with_context(|| format!("configuration does not fit `{}`", parsed.name))?;
            println!("{}", serde_json::to_string_pretty(&resolved.to_json())?);
        }
    }
    Ok(())
}

fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { dir, config } => {
            let dirs = match dir {
                Some(dir) => vec![dir],
                None => search_dirs(&config, &load_config(&config)?),
            };
            let found = discover_all(&dirs)?;
            if found.is_empty() {
                let listed: Vec<String> = dirs.iter().map(|dir| dir.display().to_string()).collect();
                println!("no script manifests found under {}", listed.join(", "));
            }
            for (path, manifest) in found {
                match manifest {
                    Ok(manifest) => {
                        let modules = if manifest.required_modules.is_empty() {
                            String::new()
                        } else {
                            format!(" [{}]", manifest.required_modules.join(", "))
                        };
                        println!(
                            "- {} v{} by {}{modules}: {}",
                            manifest.name, manifest.version, manifest.author, manifest.description
                        );
                    }
                    Err(err) => println!("! {}: {err:#}", path.display()),
                }
            }
        }
    }
    Ok(())
}

fn handle_capabilities() -> Result<()> {
    let host = ScriptHost::new(HostConfig::default())?;
    for name in CapabilityName::ALL {
        let protection = if name.is_protected() { "protected" } else { "open" };
        let availability = if host.registry().provides(name) {
            "provided"
        } else {
            "not provided"
        };
        println!("{:<18} {protection:<10} {availability}", name.as_str());
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<HostConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    HostConfig::from_toml(&expanded).with_context(|| format!("failed to parse {}", path.display()))
}

fn load_manifest(path: &Path) -> Result<Manifest> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest = Manifest::from_json(&raw)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    manifest
        .validate()
        .with_context(|| format!("manifest {} is invalid", path.display()))?;
    Ok(manifest)
}

/// Replaces `${VAR}` and `${VAR:default}` with environment values.
fn interpolate_env(input: &str) -> Result<String> {
    let regex = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]*))?\}")?;
    let result = regex.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}

/// Script search paths; relative ones are taken from the config file's directory.
fn search_dirs(config_path: &Path, config: &HostConfig) -> Vec<PathBuf> {
    let base = config_path.parent().unwrap_or_else(|| Path::new(""));
    config
        .scripts
        .search_paths
        .iter()
        .map(|dir| base.join(dir))
        .collect()
}

fn discover_all(dirs: &[PathBuf]) -> Result<Vec<(PathBuf, Result<Manifest>)>> {
    let mut found = Vec::new();
    for dir in dirs {
        found.extend(discover_plugins(dir)?);
    }
    Ok(found)
}

/// Logs whether each manifest on the search paths would load on `host`.
fn report_manifests(host: &ScriptHost, dirs: &[PathBuf]) -> Result<()> {
    for (path, manifest) in discover_all(dirs)? {
        match manifest.map(|manifest| (host.check(&manifest), manifest)) {
            Ok((Ok(()), manifest)) => {
                tracing::info!(script = %manifest.name, path = %path.display(), "found loadable manifest")
            }
            Ok((Err(err), manifest)) => {
                tracing::warn!(script = %manifest.name, path = %path.display(), error = %err, "manifest would not load")
            }
            Err(err) => tracing::warn!(path = %path.display(), error = %format!("{err:#}"), "invalid manifest"),
        }
    }
    Ok(())
}

fn discover_plugins(dir: &Path) -> Result<Vec<(PathBuf, Result<Manifest>)>> {
    let mut manifests = Vec::new();
    if !dir.exists() {
        return Ok(manifests);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let manifest = load_manifest(&path);
        manifests.push((path, manifest));
    }
    manifests.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(manifests)
}
