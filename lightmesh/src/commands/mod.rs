mod light;
mod scan;

use anyhow::{Context, Result};
use lightmesh_core::config::MeshIdentity;
use lightmesh_core::transport::Transport;
use lightmesh_core::transport::simulated::{SimulatedDevice, SimulatedTransport};
use lightmesh_core::{LightStatus, MeshClient, MeshConfig, Rgb};
use std::sync::Arc;
use tracing::debug;

use crate::cli::{Cli, Commands};
use crate::output::OutputFormat;

use light::LightAction;

pub async fn handle_command(cli: Cli) -> Result<()> {
    let output_format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Table
    };

    let config = load_config(&cli)?;
    let transport = create_transport(&cli, &config).await?;
    let client = MeshClient::new(transport, config).context("Invalid configuration")?;

    let target = cli.target();
    let action = match cli.command {
        Commands::Scan => return scan::handle_scan(&client, cli.timeout, output_format).await,
        Commands::On => LightAction::Power(true),
        Commands::Off => LightAction::Power(false),
        Commands::Brightness { level } => LightAction::Brightness(level),
        Commands::Color { color } => LightAction::Color(color),
        Commands::Status => LightAction::Status,
    };

    if target.is_some() && action == LightAction::Status {
        anyhow::bail!("Status can only be read from the connected fixture");
    }

    light::handle_light(
        &client,
        cli.device.as_deref(),
        target,
        cli.timeout,
        action,
        output_format,
    )
    .await
}

fn load_config(cli: &Cli) -> Result<MeshConfig> {
    let mut config = match &cli.config {
        Some(path) => MeshConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => MeshConfig::default(),
    };

    if let (Some(name), Some(password)) = (&cli.mesh_name, &cli.mesh_password) {
        let identity = MeshIdentity::new(name.as_str(), password.as_str())
            .context("Invalid mesh credentials")?;
        debug!("Using mesh '{identity}' as primary credentials");
        config = config.with_primary(identity);
    }

    Ok(config)
}

async fn create_transport(cli: &Cli, config: &MeshConfig) -> Result<Arc<dyn Transport>> {
    if cli.simulate {
        return Ok(Arc::new(demo_mesh().await));
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

/// Two fixtures, one per vendor, so every command can be tried without hardware
async fn demo_mesh() -> SimulatedTransport {
    let lamp = SimulatedDevice::new("sim:urbarn-lamp", 0x0001, &MeshIdentity::urbarn())
        .with_name(Some("URBARN Floor Lamp"))
        .with_rssi(-48);
    let strip = SimulatedDevice::new("sim:fulife-strip", 0x0002, &MeshIdentity::fulife())
        .with_name(Some("Fulife Strip"))
        .with_rssi(-67);

    lamp.set_status(LightStatus {
        on: true,
        brightness: 80,
        color: Rgb::new(0xff, 0xc8, 0x8c),
    })
    .await;

    SimulatedTransport::new().with_device(lamp).with_device(strip)
}
