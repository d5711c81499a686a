mod api;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use tracing::{error, info};

use mesh_core::manager::{MeshConfig, MeshManager};
use mesh_core::peer::PeerEndpoint;
use mesh_device::{LocalMidiBackend, LoopbackBackend, NullBackend};
use mesh_proto::device::{DeviceDescriptor, Direction};
use mesh_proto::node::NodeId;
use mesh_proto::{
    DEFAULT_CONTROL_PORT, DEFAULT_DATAGRAM_PORT, DEFAULT_HANDSHAKE_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_HEARTBEAT_TIMEOUT_MS, DEFAULT_STREAM_PORT,
};

#[derive(Parser, Debug)]
#[command(name = "meshd", about = "MIDI mesh node daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/meshd.toml")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
    #[serde(default)]
    pub midi: MidiSection,
    #[serde(default)]
    pub peers: Vec<PeerSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    pub name: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            stream_port: default_stream_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_control_listen")]
    pub listen: String,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_control_listen(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_reap_grace")]
    pub reap_grace_s: u64,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            reap_grace_s: default_reap_grace(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MidiSection {
    /// "loopback" (default) or "null"
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub devices: Vec<DeviceSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    pub id: u16,
    pub name: String,
    /// "input" or "output"
    pub direction: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSection {
    pub node_id: NodeId,
    pub name: String,
    pub address: IpAddr,
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    #[serde(default = "default_datagram_port")]
    pub datagram_port: u16,
}

// Default value functions
fn default_state_dir() -> PathBuf { PathBuf::from("state") }
fn default_bind() -> IpAddr { IpAddr::from([0, 0, 0, 0]) }
fn default_stream_port() -> u16 { DEFAULT_STREAM_PORT }
fn default_datagram_port() -> u16 { DEFAULT_DATAGRAM_PORT }
fn default_true() -> bool { true }
fn default_control_listen() -> String { format!("0.0.0.0:{DEFAULT_CONTROL_PORT}") }
fn default_heartbeat_interval() -> u64 { DEFAULT_HEARTBEAT_INTERVAL_MS }
fn default_heartbeat_timeout() -> u64 { DEFAULT_HEARTBEAT_TIMEOUT_MS }
fn default_handshake_timeout() -> u64 { DEFAULT_HANDSHAKE_TIMEOUT_MS }
fn default_reap_grace() -> u64 { 10 }
fn default_backend() -> String { "loopback".to_string() }

fn parse_direction(raw: &str) -> anyhow::Result<Direction> {
    match raw {
        "input" => Ok(Direction::Input),
        "output" => Ok(Direction::Output),
        other => anyhow::bail!("direction must be \"input\" or \"output\", got {other:?}"),
    }
}

fn build_backend(midi: &MidiSection) -> anyhow::Result<Arc<dyn LocalMidiBackend>> {
    let devices = midi
        .devices
        .iter()
        .map(|d| Ok(DeviceDescriptor::new(d.id, d.name.clone(), parse_direction(&d.direction)?)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    match midi.backend.as_str() {
        "loopback" => Ok(Arc::new(LoopbackBackend::new(devices))),
        "null" => {
            if !devices.is_empty() {
                anyhow::bail!("the null backend has no devices; remove [[midi.devices]]");
            }
            Ok(Arc::new(NullBackend))
        }
        other => anyhow::bail!("unknown MIDI backend {other:?}"),
    }
}

fn load_config(path: &PathBuf) -> anyhow::Result<DaemonConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {path:?}"))?;
    let config: DaemonConfig = toml::from_str(&raw).context("parsing config")?;
    if config.node.name.is_empty() {
        anyhow::bail!("node.name must not be empty");
    }
    Ok(config)
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let backend = build_backend(&config.midi)?;

    let mesh_config = MeshConfig {
        state_dir: config.node.state_dir.clone(),
        node_name: config.node.name.clone(),
        bind_address: config.network.bind,
        stream_port: config.network.stream_port,
        heartbeat_interval: Duration::from_millis(config.heartbeat.interval_ms),
        heartbeat_timeout: Duration::from_millis(config.heartbeat.timeout_ms),
        handshake_timeout: Duration::from_millis(config.heartbeat.handshake_timeout_ms),
        reap_grace: Duration::from_secs(config.heartbeat.reap_grace_s),
    };

    let directory: Vec<PeerEndpoint> = config
        .peers
        .iter()
        .map(|p| PeerEndpoint {
            node_id: p.node_id,
            name: p.name.clone(),
            address: p.address,
            stream_port: p.stream_port,
            datagram_port: p.datagram_port,
        })
        .collect();

    let manager = MeshManager::start(mesh_config, backend, directory).await?;

    // Control-plane HTTP API
    let control_task = if config.control.enabled {
        let listener = tokio::net::TcpListener::bind(&config.control.listen)
            .await
            .with_context(|| format!("binding control API on {}", config.control.listen))?;
        info!(listen = %config.control.listen, "Control API listening");
        let router = api::build_router(Arc::clone(&manager));
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "Control API server error");
            }
        }))
    } else {
        None
    };

    info!(
        node = %manager.node_id(),
        name = %manager.node_name(),
        peers = config.peers.len(),
        "Mesh daemon running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    if let Some(task) = control_task {
        task.abort();
    }
    manager.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Exit code 1: configuration problems. Exit code 2: startup
    // failures that may clear up (ports in use and the like).
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e:#}");
            return ExitCode::from(1);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Startup failed: {e:#}");
            ExitCode::from(2)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [node]
            name = "stage-left"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.name, "stage-left");
        assert_eq!(config.network.stream_port, DEFAULT_STREAM_PORT);
        assert!(config.control.enabled);
        assert_eq!(config.heartbeat.interval_ms, DEFAULT_HEARTBEAT_INTERVAL_MS);
        assert_eq!(config.midi.backend, "loopback");
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_full_config_parses() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [node]
            name = "front-of-house"
            state_dir = "/var/lib/meshd"

            [network]
            bind = "192.168.1.10"
            stream_port = 6000

            [control]
            listen = "127.0.0.1:9000"

            [heartbeat]
            interval_ms = 500
            timeout_ms = 1500

            [midi]
            backend = "loopback"

            [[midi.devices]]
            id = 2
            name = "Pads in"
            direction = "input"

            [[midi.devices]]
            id = 5
            name = "Synth out"
            direction = "output"

            [[peers]]
            node_id = "7e57ab1e-0000-4000-8000-000000000001"
            name = "stage-right"
            address = "192.168.1.11"
            stream_port = 6000
            "#,
        )
        .unwrap();

        assert_eq!(config.midi.devices.len(), 2);
        assert_eq!(config.peers.len(), 1);
        assert_eq!(config.heartbeat.timeout_ms, 1500);
        assert_eq!(config.peers[0].datagram_port, DEFAULT_DATAGRAM_PORT);
    }

    #[test]
    fn test_bad_direction_rejected() {
        let midi = MidiSection {
            backend: "loopback".to_string(),
            devices: vec![DeviceSection {
                id: 1,
                name: "X".to_string(),
                direction: "sideways".to_string(),
            }],
        };
        assert!(build_backend(&midi).is_err());
    }
}
