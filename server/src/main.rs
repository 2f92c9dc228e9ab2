use clap::Parser;
use log::{error, info};
use server::config::{EntryConfig, ServerConfig};
use server::network::Server;
use server::services::Services;
use std::path::PathBuf;
use std::sync::Arc;

/// Command line arguments. Anything not listed keeps its default.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// IP address to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0")]
    host: String,
    /// TCP port for the reliable channel
    #[arg(long, default_value = "9600")]
    tcp_port: u16,
    /// UDP port for telemetry
    #[arg(long, default_value = "9600")]
    udp_port: u16,
    /// HTTP port advertised to lobby queries
    #[arg(long, default_value = "8081")]
    http_port: u16,
    /// Position broadcasts per second
    #[arg(short, long, default_value = "18")]
    refresh_rate: u16,
    /// Number of client slots
    #[arg(short, long, default_value = "8")]
    max_clients: usize,
    /// Name shown in the lobby
    #[arg(short, long, default_value = "Racing Server")]
    name: String,
    #[arg(long, default_value = "ks_vallelunga")]
    track: String,
    #[arg(long, default_value = "")]
    track_config: String,
    /// Car model for every slot
    #[arg(long, default_value = "ks_mazda_mx5_cup")]
    car: String,
    #[arg(long)]
    password: Option<String>,
    #[arg(long)]
    admin_password: Option<String>,
    /// Content tree for checksum verification
    #[arg(long)]
    content_root: Option<PathBuf>,
    /// Message sent to every driver on spawn
    #[arg(long)]
    welcome: Option<String>,
    /// Disable batched position updates
    #[arg(long)]
    no_custom_update: bool,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig {
            name: self.name,
            host: self.host,
            tcp_port: self.tcp_port,
            udp_port: self.udp_port,
            http_port: self.http_port,
            refresh_rate_hz: self.refresh_rate,
            password: self.password,
            admin_password: self.admin_password,
            track: self.track,
            track_config: self.track_config,
            entries: (0..self.max_clients)
                .map(|_| EntryConfig::client(&self.car))
                .collect(),
            ..Default::default()
        };
        config.extra.content_root = self.content_root;
        config.extra.enable_custom_update = !self.no_custom_update;
        if let Some(welcome) = self.welcome {
            config.extra.welcome_message = welcome;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    let services = Services::in_memory(config.sun_angle, config.track_grip);
    let server = Arc::new(Server::bind(config, services).await?);

    let running = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    server.shutdown();

    match running.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!("Server stopped with an error: {}", e);
            Err(e.into())
        }
        Err(e) => {
            error!("Server task panicked: {}", e);
            Err(e.into())
        }
    }
}
