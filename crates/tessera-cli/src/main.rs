//! Tessera CLI - install, run and inspect sandboxed plugins

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tessera_plugins::builtin::BUILTIN_SCHEME;
use tessera_plugins::catalog::{self, DirectoryCatalog, PluginCatalog};
use tessera_plugins::wasm::WASM_SCHEME;
use tessera_plugins::{
    BuiltinRunner, EngineConfig, FileStorage, MessageMediator, Payload, Plugin, PluginMessage,
    PluginRegistry, PluginResult, RouterRunner, WasmRunner,
};
use tracing::debug;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about = "Sandboxed plugin execution engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage installed plugins
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },

    /// Execute a plugin
    Exec {
        /// Plugin ID
        id: Uuid,
        /// Input payload as JSON
        #[arg(short, long, default_value = "{}")]
        input: String,
    },

    /// Send a message from one plugin to another
    Send {
        /// Sender plugin ID
        from: Uuid,
        /// Target plugin ID
        to: Uuid,
        /// Message type tag
        #[arg(short = 't', long = "type", default_value = "message")]
        message_type: String,
        /// Message payload as JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PluginAction {
    /// List installed plugins
    List,
    /// List plugins available in the plugin directory
    Discover,
    /// Install a plugin from a manifest file
    Install { manifest: PathBuf },
    /// Uninstall a plugin and delete its data
    Uninstall { id: Uuid },
    /// Enable a plugin
    Enable { id: Uuid },
    /// Disable a plugin
    Disable { id: Uuid },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show all configuration values
    Show,
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.quiet { "tessera=warn" } else { "tessera=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .init();

    match cli.command {
        Commands::Plugins { action } => cmd_plugins(action, cli.format, cli.quiet).await,

        Commands::Exec { id, input } => cmd_exec(id, &input, cli.format, cli.quiet).await,

        Commands::Send {
            from,
            to,
            message_type,
            payload,
        } => cmd_send(from, to, &message_type, &payload, cli.format, cli.quiet).await,

        Commands::Config { action } => cmd_config(action, cli.format, cli.quiet),
    }
}

/// Build a registry over the configured storage and restore installed plugins
async fn open_registry(config: &EngineConfig) -> anyhow::Result<PluginRegistry> {
    let data_dir = config.data_dir()?;
    let plugin_dir = config.plugin_dir()?;

    let wasm = WasmRunner::new(&plugin_dir)?.with_fuel_limit(config.sandbox.wasm_fuel);
    let runner = RouterRunner::new()
        .with_runner(BUILTIN_SCHEME, Arc::new(BuiltinRunner::with_defaults()))
        .with_runner(WASM_SCHEME, Arc::new(wasm));

    let registry = PluginRegistry::from_config(
        config,
        Arc::new(runner),
        Arc::new(FileStorage::new(&data_dir)),
    );
    let restored = registry.initialize().await?;
    debug!(restored, data_dir = %data_dir.display(), "Registry ready");

    Ok(registry)
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_plugins(
    action: PluginAction,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let config = EngineConfig::load()?;

    match action {
        PluginAction::List => {
            let registry = open_registry(&config).await?;
            let mut rows = Vec::new();
            for plugin in registry.installed().await {
                let active = registry.is_active(plugin.id).await;
                rows.push((plugin, active));
            }

            if format == OutputFormat::Json {
                let json: Vec<_> = rows
                    .iter()
                    .map(|(plugin, active)| {
                        serde_json::json!({ "plugin": plugin, "active": active })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else if rows.is_empty() {
                if !quiet {
                    println!("No plugins installed.");
                    println!("\nInstall one with: tessera plugins install <manifest.json>");
                }
            } else {
                for (plugin, active) in &rows {
                    print_plugin_line(plugin, *active);
                }
            }
        }

        PluginAction::Discover => {
            let plugin_dir = config.plugin_dir()?;
            let entries = DirectoryCatalog::new(&plugin_dir).discover().await?;

            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else if entries.is_empty() {
                if !quiet {
                    println!("No plugins found in {}", plugin_dir.display());
                }
            } else {
                for entry in &entries {
                    let source = entry
                        .source
                        .as_deref()
                        .map(Path::display)
                        .map(|p| p.to_string())
                        .unwrap_or_default();
                    println!(
                        "{} v{} ({}) {}",
                        entry.manifest.name,
                        entry.manifest.version,
                        entry.manifest.plugin_type.as_str(),
                        source
                    );
                }
            }
        }

        PluginAction::Install { manifest } => {
            let manifest = catalog::load_manifest(&manifest)?;
            let registry = open_registry(&config).await?;
            let plugin = registry.install(manifest).await?;
            let active = registry.is_active(plugin.id).await;

            if format == OutputFormat::Json {
                let json = serde_json::json!({ "plugin": plugin, "active": active });
                println!("{}", serde_json::to_string_pretty(&json)?);
            } else if quiet {
                println!("{}", plugin.id);
            } else {
                println!("Plugin installed successfully!");
                println!("  ID: {}", plugin.id);
                println!("  Name: {}", plugin.manifest.name);
                println!("  Version: {}", plugin.manifest.version);
                println!("  Permissions: {}", permission_list(&plugin));
                println!("  Active: {}", if active { "yes" } else { "no" });
            }
        }

        PluginAction::Uninstall { id } => {
            let registry = open_registry(&config).await?;
            registry.uninstall(id).await?;
            if !quiet {
                println!("Plugin {} uninstalled.", id);
            }
        }

        PluginAction::Enable { id } => {
            let registry = open_registry(&config).await?;
            registry.enable(id).await?;
            if !quiet {
                println!("Plugin {} enabled.", id);
            }
        }

        PluginAction::Disable { id } => {
            let registry = open_registry(&config).await?;
            registry.disable(id).await?;
            if !quiet {
                println!("Plugin {} disabled.", id);
            }
        }
    }

    Ok(())
}

async fn cmd_exec(id: Uuid, input: &str, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    let input = Payload::from_json_str(input)?;
    let config = EngineConfig::load()?;
    let registry = open_registry(&config).await?;

    let result = registry.execute(id, input).await?;

    if format == OutputFormat::Json {
        let execution = registry.executions_for(id).await.pop();
        println!("{}", serde_json::to_string_pretty(&execution)?);
    } else {
        print_result(&result, quiet)?;
    }

    if !result.success {
        anyhow::bail!(
            "Plugin execution failed: {}",
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_send(
    from: Uuid,
    to: Uuid,
    message_type: &str,
    payload: &str,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let payload = Payload::from_json_str(payload)?;
    let config = EngineConfig::load()?;
    let registry = open_registry(&config).await?;
    let mediator = MessageMediator::new(registry);

    let reply = mediator
        .send_message(from, to, PluginMessage::new(message_type, payload, from))
        .await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    } else {
        if !quiet {
            println!("Reply from {} ({}):", reply.sender_id, reply.message_type);
        }
        println!("{}", reply.payload.to_json_string()?);
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = EngineConfig::load()?;
            let items = config.list()?;
            if format == OutputFormat::Json {
                let map: serde_json::Map<String, serde_json::Value> = items
                    .into_iter()
                    .map(|(key, value)| (key, serde_json::Value::String(value)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (key, value) in items {
                    println!("{} = {}", key, value);
                }
            }
        }
        ConfigAction::Get { key } => {
            let config = EngineConfig::load()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = EngineConfig::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
    }
    Ok(())
}

// ============================================================================
// Output helpers
// ============================================================================

fn print_plugin_line(plugin: &Plugin, active: bool) {
    let state = match (plugin.is_enabled, active) {
        (true, true) => "active",
        (true, false) => "installed",
        (false, _) => "disabled",
    };
    println!(
        "{}  {} v{} [{}] ({})",
        plugin.id,
        plugin.manifest.name,
        plugin.manifest.version,
        state,
        plugin.manifest.plugin_type.as_str()
    );
}

fn permission_list(plugin: &Plugin) -> String {
    if plugin.granted_permissions.is_empty() {
        return "none".to_string();
    }
    plugin
        .granted_permissions
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_result(result: &PluginResult, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        for line in &result.logs {
            println!("[log] {}", line);
        }
        println!(
            "Status: {} ({}ms)",
            if result.success { "success" } else { "failed" },
            result.duration_ms
        );
    }
    if let Some(output) = &result.output {
        println!("{}", output.to_json_string()?);
    }
    Ok(())
}
