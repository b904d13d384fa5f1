use anyhow::Result;
use comfy_table::{Cell, Color};
use indicatif::{ProgressBar, ProgressStyle};
use lightmesh_core::{Device, MeshClient};
use std::time::Duration;

use crate::output::{OutputFormat, create_table, print_json};
use crate::utils::{print_info, signal_label};

pub async fn handle_scan(
    client: &MeshClient,
    timeout: Duration,
    format: OutputFormat,
) -> Result<()> {
    let devices = scan_with_spinner(client, timeout, format).await?;

    match format {
        OutputFormat::Json => print_json(&devices),
        OutputFormat::Table => {
            if devices.is_empty() {
                print_info("No mesh fixtures found");
                return Ok(());
            }

            let mut table = create_table();
            table.set_header(vec!["Name", "Address", "Mesh", "Signal", "Last seen"]);

            for device in &devices {
                table.add_row(vec![
                    Cell::new(device.display_name()).fg(Color::Cyan),
                    Cell::new(&device.transport_id),
                    Cell::new(format!("{:#06x}", device.mesh_address)),
                    Cell::new(signal_label(device.rssi)),
                    Cell::new(device.last_seen.format("%H:%M:%S").to_string()),
                ]);
            }

            println!("{table}");
            print_info(&format!("{} fixture(s) found", devices.len()));
        }
    }

    Ok(())
}

/// Run a scan, showing a spinner on interactive table output
pub async fn scan_with_spinner(
    client: &MeshClient,
    timeout: Duration,
    format: OutputFormat,
) -> Result<Vec<Device>> {
    let spinner = (format == OutputFormat::Table).then(|| {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!(
            "Scanning for {}...",
            humantime::format_duration(timeout)
        ));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    });

    let result = client.scan(timeout).await;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    Ok(result?)
}
