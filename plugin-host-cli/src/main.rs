use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::env;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use plugin_host_core::{
    AuthorizationPrompt, AuthorizationRequest, Caller, ChannelAuthorizationHandler, FrameworkContext, InstallResult, PluginInfo,
    PluginPackage, PluginRuntime, RequestKind, RuntimeConfig,
};

/// Plugin host operations tool
#[derive(Parser, Debug)]
#[command(name = "plugin-host")]
#[command(about = "Install, inspect and run dynamically loaded plugins")]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "PLUGIN_HOST_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install a plugin package from its JSON manifest
    Install {
        manifest: PathBuf,
        /// Allow reinstalling the same or an older version
        #[arg(long)]
        force: bool,
    },
    /// Remove an installed plugin
    Uninstall { plugin_id: String },
    /// Mark a plugin to load with the enabled set
    Enable { plugin_id: String },
    /// Keep a plugin out of the enabled set
    Disable { plugin_id: String },
    /// List installed plugins
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Launch one plugin and call its entry point
    Launch {
        plugin_id: String,
        /// JSON input passed to the entry point
        #[arg(long, default_value = "null")]
        input: String,
    },
    /// Load every enabled plugin as one batch
    LoadAll,
    /// Show what a plugin depends on
    Deps { plugin_id: String },
    /// Show what depends on a plugin
    Dependents { plugin_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let mut config = RuntimeConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    // Commands decide themselves what to load.
    config.load_enabled_on_start = false;

    let (handler, prompts) = ChannelAuthorizationHandler::new();
    let context = FrameworkContext::builder(config)
        .authorization_handler(Arc::new(handler.clone()))
        .build()
        .context("failed to build plugin runtime")?;
    let runtime = PluginRuntime::new(context);
    tokio::spawn(answer_prompts(handler, prompts));

    runtime
        .initialize(async { Ok(()) })
        .await
        .context("plugin runtime initialization failed")?;
    info!(version = env!("CARGO_PKG_VERSION"), "plugin host ready");

    let host = Caller::Host;
    match args.command {
        Command::Install { manifest, force } => {
            let package = PluginPackage::from_manifest_file(&manifest)
                .with_context(|| format!("cannot read package {}", manifest.display()))?;
            match runtime.install_plugin(&host, package, force).await {
                InstallResult::Success(info) => {
                    println!("{} {} {}", "installed".bright_green(), info.id, info.version);
                }
                InstallResult::Failure { reason } => bail!("{reason}"),
            }
        }
        Command::Uninstall { plugin_id } => {
            if !runtime.uninstall_plugin(&host, &plugin_id).await {
                bail!("failed to uninstall {plugin_id}");
            }
            println!("{} {}", "uninstalled".bright_green(), plugin_id);
        }
        Command::Enable { plugin_id } => set_enabled(&runtime, &plugin_id, true).await?,
        Command::Disable { plugin_id } => set_enabled(&runtime, &plugin_id, false).await?,
        Command::List { json } => {
            let plugins = runtime.all_installed_plugins(&host).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&plugins)?);
            } else {
                print_plugins(&plugins);
            }
        }
        Command::Launch { plugin_id, input } => {
            let input: serde_json::Value = serde_json::from_str(&input).context("input is not valid JSON")?;
            if !runtime.launch_plugin(&host, &plugin_id).await {
                bail!("failed to launch {plugin_id}");
            }
            let instance = runtime
                .get_plugin_instance(&host, &plugin_id)
                .await
                .with_context(|| format!("{plugin_id} has no instance"))?;
            let output = instance.execute(input).await;
            runtime.lifecycle().unload_all().await;
            println!("{}", serde_json::to_string_pretty(&output?)?);
        }
        Command::LoadAll => {
            let count = runtime.load_enabled_plugins(&host).await;
            println!("{} {} plugin(s)", "loaded".bright_green(), count);
            for plugin in runtime.loaded_plugins(&host).await {
                println!("  {} {}", plugin.id.bright_white(), plugin.version);
            }
            runtime.lifecycle().unload_all().await;
        }
        Command::Deps { plugin_id } => {
            let chain = runtime.get_plugin_dependencies_chain(&host, &plugin_id).await;
            print_chain(&plugin_id, "depends on", &chain);
        }
        Command::Dependents { plugin_id } => {
            // Runtime edges only exist while plugins are loaded.
            runtime.load_enabled_plugins(&host).await;
            let chain = runtime.get_plugin_dependents_chain(&host, &plugin_id).await;
            print_chain(&plugin_id, "is needed by", &chain);
            runtime.lifecycle().unload_all().await;
        }
    }

    Ok(())
}

async fn set_enabled(runtime: &PluginRuntime, plugin_id: &str, enabled: bool) -> Result<()> {
    if !runtime.set_plugin_enabled(&Caller::Host, plugin_id, enabled).await {
        bail!("failed to update {plugin_id}");
    }
    let state = if enabled { "enabled".bright_green() } else { "disabled".bright_yellow() };
    println!("{} {}", state, plugin_id);
    Ok(())
}

fn print_plugins(plugins: &[PluginInfo]) {
    if plugins.is_empty() {
        println!("no plugins installed");
        return;
    }
    println!("{:<24} {:<16} {:<8} {}", "ID".bold(), "VERSION".bold(), "ENABLED".bold(), "ENTRY".bold());
    for plugin in plugins {
        let enabled = if plugin.enabled { "yes".green() } else { "no".red() };
        println!(
            "{:<24} {:<16} {:<8} {}",
            plugin.id,
            plugin.version.name,
            enabled,
            plugin.entry_point
        );
    }
}

fn print_chain(plugin_id: &str, relation: &str, chain: &[String]) {
    if chain.is_empty() {
        println!("{} {} nothing", plugin_id.bright_white(), relation);
    } else {
        println!("{} {} {}", plugin_id.bright_white(), relation, chain.join(", "));
    }
}

/// Answer authorization prompts on the terminal
async fn answer_prompts(
    handler: ChannelAuthorizationHandler,
    mut prompts: tokio::sync::mpsc::UnboundedReceiver<AuthorizationPrompt>,
) {
    while let Some(prompt) = prompts.recv().await {
        let question = describe(&prompt);
        let answer = tokio::task::spawn_blocking(move || ask(&question)).await;
        let granted = match answer {
            Ok(Ok(granted)) => granted,
            Ok(Err(e)) => {
                warn!(error = %e, "cannot read answer, denying");
                false
            }
            Err(e) => {
                warn!(error = %e, "prompt task failed, denying");
                false
            }
        };
        handler.resolve(prompt.id, granted);
    }
}

fn describe(prompt: &AuthorizationPrompt) -> String {
    let request = &prompt.request;
    let detail = |key| request.detail(key).unwrap_or("?");
    match request.kind {
        RequestKind::InstallPermission => format!(
            "Install untrusted plugin {} {} (signature {})?",
            detail(AuthorizationRequest::KEY_PLUGIN_NAME),
            detail(AuthorizationRequest::KEY_PLUGIN_VERSION),
            detail(AuthorizationRequest::KEY_SIGNATURE_HASH),
        ),
        RequestKind::ApiPermission => format!(
            "Allow {} to call {} on {}?",
            request.calling_plugin_id,
            detail(AuthorizationRequest::KEY_API_METHOD_NAME),
            request.target_plugin_id().unwrap_or("the host"),
        ),
    }
}

fn ask(question: &str) -> std::io::Result<bool> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{} [y/N] ", question.bright_yellow())?;
    stdout.flush()?;

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

fn init_tracing(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let json = env::var("PLUGIN_HOST_LOG_FORMAT").is_ok_and(|format| format == "json");

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("plugin_host={level},plugin_host_core={level}").into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_writer(std::io::stderr)
                    .with_level(true),
            )
            .init();
    }
}
