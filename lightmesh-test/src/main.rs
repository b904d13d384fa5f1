mod report;
mod runner;
mod tests;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use colored::*;
use lightmesh_core::config::MeshIdentity;
use lightmesh_core::transport::Transport;
use lightmesh_core::transport::simulated::{SimulatedDevice, SimulatedTransport};
use lightmesh_core::{LightStatus, MeshClient, MeshConfig, Rgb};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Markdown,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Args {
    /// Fixture to test: Bluetooth address or part of its advertised name
    #[arg(short = 'D', long)]
    device: Option<String>,

    /// Run against a simulated fixture instead of a Bluetooth adapter
    #[arg(long)]
    simulate: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Mesh name to try before the built-in credentials
    #[arg(long, env = "LIGHTMESH_MESH_NAME", requires = "mesh_password")]
    mesh_name: Option<String>,

    /// Mesh password paired with --mesh-name
    #[arg(long, env = "LIGHTMESH_MESH_PASSWORD", hide_env_values = true, requires = "mesh_name")]
    mesh_password: Option<String>,

    /// Test categories to run (comma-separated: discovery,session,control)
    #[arg(short, long, value_delimiter = ',')]
    tests: Option<Vec<String>>,

    /// Output format
    #[arg(short = 'f', long, default_value = "human")]
    format: OutputFormat,

    /// Output file path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Scan window (e.g. 5s, 1500ms)
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    timeout: Duration,

    /// Non-interactive mode (disables progress bars, suitable for nohup/background execution)
    #[arg(long)]
    non_interactive: bool,

    /// Quiet mode (only warnings from the session layer)
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.quiet {
        EnvFilter::new("error,lightmesh_core=warn")
    } else if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn,lightmesh_core=info")
    };

    // Check if we're connected to a TTY
    let is_tty = atty::is(atty::Stream::Stdout);
    let non_interactive = args.non_interactive || !is_tty;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .init();

    println!(
        "{separator}",
        separator = "╔════════════════════════════════════════════════════════╗".bold()
    );
    println!(
        "{title}",
        title = "║            Mesh Light Fixture Test Suite v0.1.0        ║"
            .bold()
            .cyan()
    );
    println!(
        "{separator}",
        separator = "╚════════════════════════════════════════════════════════╝".bold()
    );
    println!();

    let config = load_config(&args)?;
    let transport = create_transport(&args, &config).await?;
    let client = MeshClient::new(transport, config).context("Invalid configuration")?;

    let mut runner = runner::TestRunner::new(
        client,
        args.device.as_deref(),
        args.timeout,
        args.verbose,
        non_interactive,
    )
    .await?;

    let report = if let Some(test_list) = args.tests {
        runner.run_specific_tests(test_list).await?
    } else {
        runner.run_all_tests().await?
    };

    match args.format {
        OutputFormat::Human => {
            report.print_summary();
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&report)?;
            if let Some(output_path) = args.output {
                std::fs::write(output_path, json)?;
            } else {
                println!("{json}");
            }
        }
        OutputFormat::Markdown => {
            let markdown = report.to_markdown();
            if let Some(output_path) = args.output {
                std::fs::write(output_path, markdown)?;
            } else {
                println!("{markdown}");
            }
        }
    }

    if report.tests_failed > 0 {
        std::process::exit(1);
    }

    Ok(())
}

fn load_config(args: &Args) -> Result<MeshConfig> {
    let mut config = match &args.config {
        Some(path) => MeshConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => MeshConfig::default(),
    };

    if let (Some(name), Some(password)) = (&args.mesh_name, &args.mesh_password) {
        config = config.with_primary(MeshIdentity::new(name.as_str(), password.as_str())?);
    }

    Ok(config)
}

async fn create_transport(args: &Args, config: &MeshConfig) -> Result<Arc<dyn Transport>> {
    if args.simulate {
        eprintln!(
            "{arrow} Using simulated fixture",
            arrow = "→".yellow()
        );
        let fixture = SimulatedDevice::new("sim:test-fixture", 0x0010, &MeshIdentity::urbarn())
            .with_name(Some("URBARN Test Fixture"));
        fixture
            .set_status(LightStatus {
                on: true,
                brightness: 60,
                color: Rgb::new(0xff, 0xff, 0xff),
            })
            .await;
        return Ok(Arc::new(SimulatedTransport::new().with_device(fixture)));
    }

    #[cfg(feature = "bluetooth")]
    {
        use lightmesh_core::transport::ble::BleTransport;

        let transport = BleTransport::new(config.discovery.clone())
            .await
            .context("Failed to open Bluetooth adapter")?;
        Ok(Arc::new(transport))
    }

    #[cfg(not(feature = "bluetooth"))]
    {
        let _ = config;
        anyhow::bail!(
            "Bluetooth support not compiled in. Rebuild with --features bluetooth, or pass --simulate"
        )
    }
}
