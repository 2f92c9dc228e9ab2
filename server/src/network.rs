//! Network bootstrap.
//!
//! [`Server`] binds the reliable listener and the shared datagram socket,
//! builds the [`ServerContext`] and runs the long-lived tasks:
//!
//! - **Accept loop**: one [`Connection`] with its own receive and send tasks
//!   per accepted stream
//! - **Datagram loop**: every datagram, in arrival order
//! - **Tick loop**: fixed-rate housekeeping and position fan-out
//!
//! All of them stop when [`Server::shutdown`] is called.

use crate::broadcast::run_tick_loop;
use crate::checksum::ChecksumManifest;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::datagram::run_datagram_loop;
use crate::error::ServerError;
use crate::events::ServerEvents;
use crate::services::Services;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};

/// Back-off after a failed accept, e.g. when out of file descriptors.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    udp: Arc<UdpSocket>,
}

impl Server {
    /// Binds both sockets. Checksums are built from the configured content
    /// root; without one they are not enforced.
    pub async fn bind(config: ServerConfig, services: Services) -> Result<Self, ServerError> {
        let manifest = match &config.extra.content_root {
            Some(root) => {
                let models = config.car_models();
                let manifest =
                    ChecksumManifest::from_content(root, &config.track, &config.track_config, &models)?;
                manifest.validate_models(&models, config.extra.ignore_missing_car_checksums)?;
                manifest
            }
            None => {
                warn!("No content root configured, checksums only check the payload length");
                ChecksumManifest::new()
            }
        };
        Self::bind_with(config, services, manifest, ServerEvents::new()).await
    }

    /// Binds with an explicit manifest and observers registered up front.
    ///
    /// Port 0 binds an ephemeral port; the configuration seen by clients is
    /// updated with the ports actually bound.
    pub async fn bind_with(
        mut config: ServerConfig,
        services: Services,
        manifest: ChecksumManifest,
        events: ServerEvents,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let listener = TcpListener::bind((config.host.as_str(), config.tcp_port)).await?;
        let udp = UdpSocket::bind((config.host.as_str(), config.udp_port)).await?;
        config.tcp_port = listener.local_addr()?.port();
        config.udp_port = udp.local_addr()?.port();

        let ctx = ServerContext::with_events(config, services, manifest, events)?;
        let udp = Arc::new(udp);
        ctx.attach_udp(Arc::clone(&udp));

        info!(
            "{} bound on TCP {} and UDP {}",
            ctx.config().name,
            listener.local_addr()?,
            udp.local_addr()?
        );
        Ok(Self { ctx, listener, udp })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn local_tcp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn local_udp_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.udp.local_addr()?)
    }

    /// Stops every loop started by [`run`](Self::run).
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.ctx.request_shutdown();
    }

    /// Runs until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> Result<(), ServerError> {
        let ctx = &self.ctx;
        let datagrams = tokio::spawn(run_datagram_loop(Arc::clone(ctx), Arc::clone(&self.udp)));
        let ticks = tokio::spawn(run_tick_loop(Arc::clone(ctx)));
        let mut shutdown = ctx.shutdown_signal();

        info!(
            "Server started: {} slots, track {}",
            ctx.slots().len(),
            ctx.config().track
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted stream from {}", peer);
                        let connection = Connection::new(ctx, Some(peer));
                        tokio::spawn(connection.serve(stream));
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                },
            }
        }

        for connection in ctx.slots().connections() {
            connection.begin_disconnect();
        }
        if let Err(e) = datagrams.await {
            error!("Datagram task failed: {}", e);
        }
        if let Err(e) = ticks.await {
            error!("Tick task failed: {}", e);
        }

        info!("Server stopped");
        Ok(())
    }
}
