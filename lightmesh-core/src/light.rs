use tracing::debug;

use crate::command::{Command, LightStatus, Rgb};
use crate::connection::SessionManager;
use crate::error::{MeshError, Result};

/// Switch a fixture on or off
pub async fn set_power(session: &SessionManager, on: bool) -> Result<()> {
    set_power_to(session, session.device().mesh_address, on).await
}

/// Switch the node at `mesh_address` on or off, relayed by the connected
/// fixture. [`BROADCAST_ADDRESS`](crate::codec::BROADCAST_ADDRESS) reaches
/// every node on the mesh.
pub async fn set_power_to(session: &SessionManager, mesh_address: u16, on: bool) -> Result<()> {
    session
        .send_command_to(mesh_address, Command::Power(on))
        .await?;
    debug!(
        "{:#06x} switched {} via {}",
        mesh_address,
        if on { "on" } else { "off" },
        session.transport_id()
    );
    Ok(())
}

/// Set brightness in percent, 0 to 100
pub async fn set_brightness(session: &SessionManager, level: u8) -> Result<()> {
    set_brightness_to(session, session.device().mesh_address, level).await
}

pub async fn set_brightness_to(
    session: &SessionManager,
    mesh_address: u16,
    level: u8,
) -> Result<()> {
    let command = Command::brightness(level).map_err(MeshError::InvalidArgument)?;
    session.send_command_to(mesh_address, command).await?;
    debug!(
        "{:#06x} brightness set to {level}% via {}",
        mesh_address,
        session.transport_id()
    );
    Ok(())
}

pub async fn set_color(session: &SessionManager, color: Rgb) -> Result<()> {
    set_color_to(session, session.device().mesh_address, color).await
}

pub async fn set_color_to(session: &SessionManager, mesh_address: u16, color: Rgb) -> Result<()> {
    session
        .send_command_to(mesh_address, Command::Color(color))
        .await?;
    debug!(
        "{:#06x} color set to {color} via {}",
        mesh_address,
        session.transport_id()
    );
    Ok(())
}

/// Read the fixture's current power, brightness and color
pub async fn query_status(session: &SessionManager) -> Result<LightStatus> {
    session.query_status().await
}
