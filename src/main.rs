use std::io::Read;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use fluux_sandbox::capability::builtin::{ClockCapability, KvCapability, RngCapability};
use fluux_sandbox::{CapabilityRegistry, Sandbox, SandboxConfig};

fn print_help() {
    println!(
        "\
fluux-sandbox v{}

A sandboxed JavaScript execution engine for agent skills.

USAGE:
    fluux-sandbox [OPTIONS] [SCRIPT_PATH]

ARGUMENTS:
    SCRIPT_PATH    Path to a script file, or '-' to read from stdin
                   [default: read from stdin]

OPTIONS:
    -e <CODE>        Execute the given script text directly
    -c <PATH>        Path to TOML configuration file
    --compact        Print the envelope as a single JSON line
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG    Log level filter for tracing
                (e.g. debug, fluux_sandbox=debug,warn)

EXIT STATUS:
    0 if the envelope reports ok, 1 otherwise.

EXAMPLES:
    fluux-sandbox -e 'return 1 + 1;'
    fluux-sandbox script.js
    echo 'console.log(\"hi\");' | fluux-sandbox
    fluux-sandbox -c sandbox.toml -e 'await clock.sleep({{ ms: 100 }});'",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path: Option<String> = None;
    let mut inline: Option<String> = None;
    let mut script_path: Option<String> = None;
    let mut compact = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("fluux-sandbox v{}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" => {
                print_help();
                return Ok(());
            }
            "-e" => {
                inline = Some(args.next().ok_or_else(|| anyhow!("-e requires a script"))?);
            }
            "-c" => {
                config_path = Some(args.next().ok_or_else(|| anyhow!("-c requires a path"))?);
            }
            "--compact" => compact = true,
            other if other.starts_with('-') && other != "-" => {
                return Err(anyhow!("Unknown option: {other} (see --help)"));
            }
            other => script_path = Some(other.to_string()),
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("fluux_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &config_path {
        Some(path) => {
            info!("Loading configuration from {path}");
            SandboxConfig::load(path)?
        }
        None => SandboxConfig::default(),
    };
    info!(
        "Limits: {}ms budget, {} timers, {} log entries",
        config.limits.timeout_ms, config.limits.max_timers, config.limits.max_log_entries
    );

    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(ClockCapability));
    registry.register(Arc::new(KvCapability::new()));
    registry.register(Arc::new(RngCapability));
    info!("Capabilities: {} registered", registry.len());

    let code = match (inline, script_path.as_deref()) {
        (Some(code), _) => code,
        (None, Some("-")) | (None, None) => {
            let mut buffer = String::new();
            std::io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
        (None, Some(path)) => std::fs::read_to_string(path)?,
    };

    let sandbox = Sandbox::new(Arc::new(registry), config);
    let envelope = sandbox.execute(&code).await;

    let output = if compact {
        serde_json::to_string(&envelope)?
    } else {
        serde_json::to_string_pretty(&envelope)?
    };
    println!("{output}");

    std::process::exit(if envelope.ok { 0 } else { 1 });
}
