use clap::{Parser, Subcommand};
use lightmesh_core::Rgb;
use lightmesh_core::codec::BROADCAST_ADDRESS;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "lightmesh")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Fixture to control: Bluetooth address or part of its advertised name.
    /// Defaults to the strongest fixture found.
    #[arg(short = 'D', long, global = true)]
    pub device: Option<String>,

    /// Mesh address of the node to control, relayed through the connected
    /// fixture (hex, e.g. 0x0031)
    #[arg(long, global = true, value_parser = parse_mesh_address, conflicts_with = "broadcast")]
    pub node: Option<u16>,

    /// Send light commands to every node on the mesh
    #[arg(long, global = true)]
    pub broadcast: bool,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Mesh name to try before the built-in URBARN and Fulife credentials
    #[arg(long, global = true, env = "LIGHTMESH_MESH_NAME", requires = "mesh_password")]
    pub mesh_name: Option<String>,

    /// Mesh password paired with --mesh-name
    #[arg(
        long,
        global = true,
        env = "LIGHTMESH_MESH_PASSWORD",
        hide_env_values = true,
        requires = "mesh_name"
    )]
    pub mesh_password: Option<String>,

    /// Output in JSON format
    #[arg(short = 'j', long, global = true)]
    pub json: bool,

    /// Scan window (e.g. 5s, 1500ms)
    #[arg(short = 't', long, global = true, default_value = "5s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// Talk to a built-in simulated mesh instead of a Bluetooth adapter
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Mesh address light commands go to, when not the connected fixture
    pub fn target(&self) -> Option<u16> {
        if self.broadcast {
            Some(BROADCAST_ADDRESS)
        } else {
            self.node
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List mesh light fixtures in range
    Scan,

    /// Switch a fixture on
    On,

    /// Switch a fixture off
    Off,

    /// Set brightness in percent
    Brightness {
        /// Level from 0 to 100
        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        level: u8,
    },

    /// Set the light color
    Color {
        /// Hex color, e.g. ff8800 or '#ff8800'
        #[arg(value_parser = parse_color)]
        color: Rgb,
    },

    /// Read a fixture's power, brightness and color
    Status,
}

fn parse_color(s: &str) -> Result<Rgb, String> {
    s.parse()
}

fn parse_mesh_address(s: &str) -> Result<u16, String> {
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid mesh address '{s}': {e}"))
}
