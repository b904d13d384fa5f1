use anyhow::{Context, Result, anyhow};
use colored::*;
use lightmesh_core::{Device, LightStatus, MeshClient, Rgb, SessionManager, light};
use serde::Serialize;
use std::time::{Duration, Instant};

use super::scan::scan_with_spinner;
use crate::output::{OutputFormat, create_table, print_json};
use crate::utils::{print_success, print_warning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action", content = "value")]
pub enum LightAction {
    Power(bool),
    Brightness(u8),
    Color(Rgb),
    Status,
}

#[derive(Debug, Serialize)]
struct ActionReport {
    device: String,
    transport_id: String,
    mesh_address: u16,
    mesh: Option<String>,
    action: LightAction,
    status: Option<LightStatus>,
    last_sequence: Option<u32>,
    elapsed_ms: u128,
}

pub async fn handle_light(
    client: &MeshClient,
    selector: Option<&str>,
    target: Option<u16>,
    timeout: Duration,
    action: LightAction,
    format: OutputFormat,
) -> Result<()> {
    let devices = scan_with_spinner(client, timeout, format).await?;
    let device = select_device(&devices, selector)?;

    let started = Instant::now();
    let session = client
        .connect(device)
        .await
        .with_context(|| format!("Failed to connect to {}", device.display_name()))?;

    let mesh_address = target.unwrap_or(device.mesh_address);
    let outcome = apply(&session, mesh_address, action).await;
    let mesh = session.identity().await.map(|identity| identity.to_string());
    let last_sequence = session.last_sequence().await;

    if let Err(e) = client.disconnect(&session).await {
        print_warning(&format!("Disconnect failed: {e}"));
    }

    let status = outcome.with_context(|| format!("{} failed", describe(action)))?;

    let report = ActionReport {
        device: device.display_name().to_string(),
        transport_id: device.transport_id.to_string(),
        mesh_address,
        mesh,
        action,
        status,
        last_sequence,
        elapsed_ms: started.elapsed().as_millis(),
    };

    match format {
        OutputFormat::Json => print_json(&report),
        OutputFormat::Table => print_report(&report),
    }

    Ok(())
}

async fn apply(
    session: &SessionManager,
    mesh_address: u16,
    action: LightAction,
) -> Result<Option<LightStatus>> {
    match action {
        LightAction::Power(on) => light::set_power_to(session, mesh_address, on).await?,
        LightAction::Brightness(level) => {
            light::set_brightness_to(session, mesh_address, level).await?
        }
        LightAction::Color(color) => light::set_color_to(session, mesh_address, color).await?,
        LightAction::Status => return Ok(Some(light::query_status(session).await?)),
    }
    Ok(None)
}

/// Match by exact address first, then by case-insensitive name substring.
/// Without a selector the strongest fixture wins.
fn select_device<'a>(devices: &'a [Device], selector: Option<&str>) -> Result<&'a Device> {
    let Some(selector) = selector else {
        return devices
            .first()
            .ok_or_else(|| anyhow!("No mesh fixtures found. Is the light powered and in range?"));
    };

    if let Some(device) = devices
        .iter()
        .find(|d| d.transport_id.as_str().eq_ignore_ascii_case(selector))
    {
        return Ok(device);
    }

    let needle = selector.to_lowercase();
    devices
        .iter()
        .find(|d| {
            d.name
                .as_deref()
                .is_some_and(|name| name.to_lowercase().contains(&needle))
        })
        .ok_or_else(|| anyhow!("No fixture matching '{selector}' found"))
}

fn describe(action: LightAction) -> String {
    match action {
        LightAction::Power(true) => "Turn on".to_string(),
        LightAction::Power(false) => "Turn off".to_string(),
        LightAction::Brightness(level) => format!("Set brightness to {level}%"),
        LightAction::Color(color) => format!("Set color to {color}"),
        LightAction::Status => "Status query".to_string(),
    }
}

fn print_report(report: &ActionReport) {
    let Some(status) = report.status else {
        print_success(&format!(
            "{} on {} ({} ms)",
            describe(report.action),
            report.device,
            report.elapsed_ms
        ));
        return;
    };

    let mut table = create_table();
    table.set_header(vec!["Property", "Value"]);
    table.add_row(vec!["Device", report.device.as_str()]);
    table.add_row(vec!["Address", report.transport_id.as_str()]);
    table.add_row(vec![
        "Mesh".to_string(),
        report.mesh.clone().unwrap_or_else(|| "-".to_string()),
    ]);
    table.add_row(vec![
        "Power".to_string(),
        if status.on {
            "on".green().to_string()
        } else {
            "off".red().to_string()
        },
    ]);
    table.add_row(vec!["Brightness".to_string(), format!("{}%", status.brightness)]);
    table.add_row(vec!["Color".to_string(), status.color.to_string()]);
    println!("{table}");
}
