//! Datagram dispatch.
//!
//! One task owns the server's UDP socket and handles datagrams strictly in
//! arrival order. Only two kinds are accepted from unknown senders: the lobby
//! query and the endpoint binding request. Everything else must come from an
//! address already mapped to a slot and is dropped otherwise.

use crate::context::ServerContext;
use crate::error::ServerError;
use crate::slots::{ClientSlot, SlotId};
use log::{debug, info, trace, warn};
use parking_lot::RwLock;
use shared::packets::{CarConnect, LobbyCheckResponse, PingPong, SessionRequest};
use shared::{
    to_bytes, Decode, ExtendedUdpId, KickReason, PacketId, PacketReader, PositionUpdateIn,
    SessionType, MAX_DATAGRAM_SIZE,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Datagram source address to slot.
#[derive(Debug, Default)]
pub struct EndpointMap {
    endpoints: RwLock<HashMap<SocketAddr, SlotId>>,
}

impl EndpointMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, addr: SocketAddr, slot_id: SlotId) {
        self.endpoints.write().insert(addr, slot_id);
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<SlotId> {
        self.endpoints.write().remove(addr)
    }

    pub fn lookup(&self, addr: &SocketAddr) -> Option<SlotId> {
        self.endpoints.read().get(addr).copied()
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

/// Receives datagrams until shutdown is requested.
pub async fn run_datagram_loop(ctx: Arc<ServerContext>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut shutdown = ctx.shutdown_signal();

    loop {
        let (len, addr) = tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms.
                    debug!("Datagram receive error: {}", e);
                    continue;
                }
            },
        };

        match handle_datagram(&ctx, addr, &buf[..len]) {
            Ok(Some(reply)) => ctx.send_datagram_to(addr, &reply),
            Ok(None) => {}
            Err(e) => debug!("Dropped datagram from {}: {}", addr, e),
        }
    }
    debug!("Datagram loop stopped");
}

/// Handles one datagram and returns the direct reply, if any.
pub fn handle_datagram(
    ctx: &ServerContext,
    addr: SocketAddr,
    data: &[u8],
) -> Result<Option<Vec<u8>>, ServerError> {
    let mut reader = PacketReader::new(data);
    let tag = reader.read_u8()?;
    let Ok(id) = PacketId::try_from(tag) else {
        trace!("Unknown datagram 0x{:02X} from {}", tag, addr);
        return Ok(None);
    };

    match id {
        PacketId::LobbyCheck => {
            let reply = LobbyCheckResponse {
                http_port: ctx.config().http_port,
            };
            return Ok(Some(to_bytes(&reply)?));
        }
        PacketId::CarConnect => return bind_endpoint(ctx, addr, CarConnect::decode(&mut reader)?),
        _ => {}
    }

    let Some(slot_id) = ctx.endpoints().lookup(&addr) else {
        trace!("Datagram 0x{:02X} from unbound endpoint {}", tag, addr);
        return Ok(None);
    };
    let Some(slot) = ctx.slots().client(slot_id) else {
        return Ok(None);
    };
    let Some(connection) = slot.connection() else {
        return Ok(None);
    };
    if connection.is_disconnect_requested() || connection.udp_addr() != Some(addr) {
        return Ok(None);
    }
    let now = ctx.now_ms();

    match id {
        PacketId::SessionRequest => {
            let request = SessionRequest::decode(&mut reader)?;
            let current = ctx.sessions().current_type();
            if SessionType::try_from(request.session_type).ok() != Some(current) {
                debug!("{} asked for a stale session, resending", connection.name());
                ctx.send_current_session(&connection);
            }
        }
        PacketId::PositionUpdate => {
            let update = PositionUpdateIn::decode(&mut reader)?;
            if let Err(e) = connection.on_position_update(&update, now) {
                warn!("Dropping {}: {}", connection.name(), e);
                connection.begin_disconnect();
                return Err(e);
            }
        }
        PacketId::PingPong => {
            let pong = PingPong::decode(&mut reader)?;
            let extra = &ctx.config().extra;
            let high_ping = slot.record_pong(
                now,
                pong.server_time,
                pong.client_time,
                extra.max_ping_ms,
                extra.max_ping_seconds,
            );
            if let Some(ping) = high_ping {
                ctx.kick(
                    &connection,
                    KickReason::Kicked,
                    &format!("high ping ({}ms)", ping),
                    None,
                );
            }
        }
        PacketId::Extended => {
            let sub_tag = reader.read_u8()?;
            let is_client_message =
                matches!(ExtendedUdpId::try_from(sub_tag), Ok(ExtendedUdpId::ClientMessage));
            if is_client_message && ctx.config().extra.enable_udp_client_messages {
                ctx.services()
                    .client_messages
                    .on_client_message(&connection, reader.rest(), false);
            }
        }
        other => trace!("Ignoring datagram {:?} from {}", other, connection.name()),
    }
    Ok(None)
}

/// Binds `addr` to a slot the first time its owner asks, from the same host
/// as its stream.
fn bind_endpoint(
    ctx: &ServerContext,
    addr: SocketAddr,
    request: CarConnect,
) -> Result<Option<Vec<u8>>, ServerError> {
    let connection = ctx
        .slots()
        .client(request.slot_id)
        .and_then(ClientSlot::connection);
    let Some(connection) = connection else {
        debug!("Endpoint {} asked for unbound slot {}", addr, request.slot_id);
        return Ok(None);
    };

    if connection.peer().map(|peer| peer.ip()) != Some(addr.ip()) {
        warn!(
            "Endpoint {} claimed slot {} held by {}",
            addr,
            request.slot_id,
            connection.name()
        );
        return Ok(None);
    }

    if connection.bind_udp(addr) {
        ctx.endpoints().bind(addr, request.slot_id);
        info!("{} bound datagram endpoint {}", connection.name(), addr);
    } else if connection.udp_addr() != Some(addr) {
        debug!(
            "{} already has an endpoint, ignoring {}",
            connection.name(),
            addr
        );
        return Ok(None);
    }

    Ok(Some(to_bytes(&CarConnect {
        slot_id: request.slot_id,
    })?))
}
