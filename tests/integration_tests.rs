//! Integration tests for the racing server
//!
//! These tests run a real server on ephemeral localhost ports and talk to it
//! over TCP and UDP exactly like a game client would.

use assert_approx_eq::assert_approx_eq;
use server::checksum::ChecksumManifest;
use server::config::ServerConfig;
use server::events::ServerEvents;
use server::network::Server;
use server::services::Services;
use shared::framing::{read_frame, write_frame, FrameConfig};
use shared::handshake::{HandshakeRejection, HandshakeRequest, HandshakeResponse};
use shared::packets::{
    CarConnect, CarDisconnected, CarListRequest, CarListResponse, ChatMessage, ChecksumReport,
    KickCar, LapCompletedOut, LobbyCheck,
};
use shared::{
    to_bytes, Decode, KickReason, PacketId, PacketReader, PositionUpdateIn, PositionUpdateOut,
    Vector3, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(5);

fn frames() -> FrameConfig {
    FrameConfig {
        max_payload_size: u16::MAX,
    }
}

fn local_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        tcp_port: 0,
        udp_port: 0,
        ..Default::default()
    }
}

async fn start_server(config: ServerConfig) -> Arc<Server> {
    let server = Arc::new(
        Server::bind_with(
            config,
            Services::in_memory(16.0, 1.0),
            ChecksumManifest::new(),
            ServerEvents::new(),
        )
        .await
        .unwrap(),
    );
    let running = Arc::clone(&server);
    tokio::spawn(async move { running.run().await });
    server
}

fn request(guid: u64, name: &str) -> HandshakeRequest {
    HandshakeRequest {
        client_version: PROTOCOL_VERSION,
        guid,
        name: name.into(),
        team: String::new(),
        nation: "ITA".into(),
        requested_car: "ks_mazda_mx5_cup".into(),
        password: String::new(),
        features: Vec::new(),
    }
}

/// Polls `condition` until it holds or the wait runs out.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

async fn next_frame_tagged(reader: &mut OwnedReadHalf, id: PacketId) -> Vec<u8> {
    timeout(WAIT, async {
        loop {
            let frame = read_frame(reader, &frames()).await.unwrap();
            if frame[0] == u8::from(id) {
                return frame;
            }
        }
    })
    .await
    .expect("frame never arrived")
}

async fn next_datagram_tagged(socket: &UdpSocket, id: PacketId) -> Vec<u8> {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    timeout(WAIT, async {
        loop {
            let (len, _) = socket.recv_from(&mut buf).await.unwrap();
            if buf[0] == u8::from(id) {
                return buf[..len].to_vec();
            }
        }
    })
    .await
    .expect("datagram never arrived")
}

async fn handshake(
    server: &Server,
    request: &HandshakeRequest,
) -> (OwnedReadHalf, OwnedWriteHalf, Vec<u8>) {
    let stream = TcpStream::connect(server.local_tcp_addr().unwrap())
        .await
        .unwrap();
    let (mut reader, mut writer) = stream.into_split();
    write_frame(&mut writer, &to_bytes(request).unwrap(), &frames())
        .await
        .unwrap();
    let frame = timeout(WAIT, read_frame(&mut reader, &frames()))
        .await
        .unwrap()
        .unwrap();
    (reader, writer, frame)
}

/// A client that completed the handshake, bound UDP, passed the checksum
/// check and received its first update sequence.
struct TestClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    udp: UdpSocket,
    server_udp: SocketAddr,
    slot_id: u8,
}

impl TestClient {
    async fn join(server: &Server, guid: u64, name: &str) -> Self {
        let (mut reader, mut writer, frame) = handshake(server, &request(guid, name)).await;
        assert_eq!(frame[0], u8::from(PacketId::NewCarConnection));
        let response = HandshakeResponse::decode(&mut PacketReader::new(&frame[1..])).unwrap();
        let slot_id = response.slot_id;

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_udp = server.local_udp_addr().unwrap();
        udp.send_to(&to_bytes(&CarConnect { slot_id }).unwrap(), server_udp)
            .await
            .unwrap();
        let echo = next_datagram_tagged(&udp, PacketId::CarConnect).await;
        assert_eq!(echo, vec![u8::from(PacketId::CarConnect), slot_id]);

        let report = ChecksumReport {
            payload: vec![0u8; 16],
        };
        write_frame(&mut writer, &to_bytes(&report).unwrap(), &frames())
            .await
            .unwrap();
        let ctx = Arc::clone(server.context());
        wait_until(|| {
            ctx.slots()
                .client(slot_id)
                .and_then(|slot| slot.connection())
                .is_some_and(|c| c.has_passed_checksum())
        })
        .await;

        let mut client = Self {
            reader,
            writer,
            udp,
            server_udp,
            slot_id,
        };
        client.send_position(Vector3::new(0.0, 0.0, 0.0)).await;

        let standings = client.next_frame(PacketId::LapCompleted).await;
        assert_eq!(standings[1], LapCompletedOut::STANDINGS_ONLY);
        client
    }

    async fn send_position(&self, position: Vector3) {
        let update = PositionUpdateIn {
            position,
            ..Default::default()
        };
        self.udp
            .send_to(&to_bytes(&update).unwrap(), self.server_udp)
            .await
            .unwrap();
    }

    async fn send_frame(&mut self, bytes: &[u8]) {
        write_frame(&mut self.writer, bytes, &frames()).await.unwrap();
    }

    async fn next_frame(&mut self, id: PacketId) -> Vec<u8> {
        next_frame_tagged(&mut self.reader, id).await
    }
}

/// HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    /// Tests that an accepted handshake carries the slot and server settings
    #[tokio::test]
    async fn accepted_handshake_describes_the_server() {
        let server = start_server(local_config()).await;
        let (_reader, _writer, frame) = handshake(&server, &request(1, "Alice")).await;

        assert_eq!(frame[0], u8::from(PacketId::NewCarConnection));
        let response = HandshakeResponse::decode(&mut PacketReader::new(&frame[1..])).unwrap();
        assert_eq!(response.slot_id, 0);
        assert_eq!(response.car_model, "ks_mazda_mx5_cup");
        assert_eq!(response.udp_port, server.local_udp_addr().unwrap().port());
        assert_eq!(response.sessions.len(), 3);
        assert_eq!(server.context().slots().connected_count(), 1);
    }

    /// Tests that a wrong password gets a typed rejection and a closed stream
    #[tokio::test]
    async fn wrong_password_is_rejected_and_closed() {
        let mut config = local_config();
        config.password = Some("secret".into());
        let server = start_server(config).await;

        let (mut reader, _writer, frame) = handshake(&server, &request(1, "Alice")).await;
        assert_eq!(
            HandshakeRejection::from_frame(&frame).unwrap(),
            HandshakeRejection::WrongPassword
        );
        let next = timeout(WAIT, read_frame(&mut reader, &frames())).await.unwrap();
        assert!(next.is_err());
        assert_eq!(server.context().slots().connected_count(), 0);
    }

    /// Tests that an old client is told which protocol version to use
    #[tokio::test]
    async fn old_protocol_version_is_rejected() {
        let server = start_server(local_config()).await;
        let mut old = request(1, "Alice");
        old.client_version = PROTOCOL_VERSION - 1;

        let (_reader, _writer, frame) = handshake(&server, &old).await;
        assert_eq!(
            HandshakeRejection::from_frame(&frame).unwrap(),
            HandshakeRejection::UnsupportedProtocol {
                server_version: PROTOCOL_VERSION
            }
        );
    }

    /// Tests that the server refuses once every slot is taken
    #[tokio::test]
    async fn full_server_reports_no_slots() {
        let mut config = local_config();
        config.entries.truncate(1);
        let server = start_server(config).await;

        let (_r1, _w1, first) = handshake(&server, &request(1, "Alice")).await;
        assert_eq!(first[0], u8::from(PacketId::NewCarConnection));
        let (_r2, _w2, second) = handshake(&server, &request(2, "Bob")).await;
        assert_eq!(
            HandshakeRejection::from_frame(&second).unwrap(),
            HandshakeRejection::NoSlotsAvailable
        );
    }
}

/// DATAGRAM TESTS
mod datagram_tests {
    use super::*;

    /// Tests that the lobby query is answered with the HTTP port
    #[tokio::test]
    async fn lobby_check_reports_http_port() {
        let server = start_server(local_config()).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        socket
            .send_to(&to_bytes(&LobbyCheck).unwrap(), server.local_udp_addr().unwrap())
            .await
            .unwrap();

        let reply = next_datagram_tagged(&socket, PacketId::LobbyCheck).await;
        let port = server.context().config().http_port.to_le_bytes();
        assert_eq!(reply, vec![u8::from(PacketId::LobbyCheck), port[0], port[1]]);
    }

    /// Tests that a joined client's endpoint is tracked and released on exit
    #[tokio::test]
    async fn endpoint_is_released_when_the_stream_closes() {
        let server = start_server(local_config()).await;
        let client = TestClient::join(&server, 1, "Alice").await;
        let ctx = Arc::clone(server.context());
        assert_eq!(ctx.endpoints().len(), 1);

        drop(client);
        wait_until(|| ctx.endpoints().is_empty() && ctx.slots().connected_count() == 0).await;
    }

    /// Tests that one car's telemetry reaches the other client at tick rate
    #[tokio::test]
    async fn positions_are_relayed_between_clients() {
        let server = start_server(local_config()).await;
        let alice = TestClient::join(&server, 1, "Alice").await;
        let bob = TestClient::join(&server, 2, "Bob").await;

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let mut relayed: Option<PositionUpdateOut> = None;
        for _ in 0..25 {
            alice.send_position(Vector3::new(123.0, 4.0, -56.0)).await;
            let Ok(received) = timeout(Duration::from_millis(200), bob.udp.recv_from(&mut buf)).await
            else {
                continue;
            };
            let (len, _) = received.unwrap();
            if buf[0] != u8::from(PacketId::PositionUpdate) {
                continue;
            }
            let mut reader = PacketReader::new(&buf[1..len]);
            let update: PositionUpdateOut = reader.read_struct().unwrap();
            if update.session_id == alice.slot_id && update.position.x > 100.0 {
                relayed = Some(update);
                break;
            }
        }

        let update = relayed.expect("position was never relayed");
        assert_approx_eq!(update.position.x, 123.0);
        assert_approx_eq!(update.position.y, 4.0);
        assert_approx_eq!(update.position.z, -56.0);
    }
}

/// RELIABLE CHANNEL TESTS
mod reliable_tests {
    use super::*;

    /// Tests that chat is relayed to everyone with the sender's slot
    #[tokio::test]
    async fn chat_reaches_other_clients() {
        let server = start_server(local_config()).await;
        let mut alice = TestClient::join(&server, 1, "Alice").await;
        let mut bob = TestClient::join(&server, 2, "Bob").await;

        let chat = ChatMessage {
            slot_id: 200,
            message: "good luck".into(),
        };
        alice.send_frame(&to_bytes(&chat).unwrap()).await;

        let frame = bob.next_frame(PacketId::Chat).await;
        let relayed = ChatMessage::decode(&mut PacketReader::new(&frame[1..])).unwrap();
        assert_eq!(relayed.slot_id, alice.slot_id);
        assert_eq!(relayed.message, "good luck");
    }

    /// Tests that the car list names the connected driver
    #[tokio::test]
    async fn car_list_names_connected_drivers() {
        let server = start_server(local_config()).await;
        let mut alice = TestClient::join(&server, 1, "Alice").await;

        alice
            .send_frame(&to_bytes(&CarListRequest { page_index: 0 }).unwrap())
            .await;
        let frame = alice.next_frame(PacketId::CarList).await;
        let list = CarListResponse::decode(&mut PacketReader::new(&frame[1..])).unwrap();

        assert_eq!(list.entries.len(), 8);
        let own = &list.entries[alice.slot_id as usize];
        assert_eq!(own.driver_name, "Alice");
        assert!(list.entries[1].driver_name.is_empty());
    }

    /// Tests that a kick reaches the target and everyone sees the car leave
    #[tokio::test]
    async fn kick_disconnects_and_announces() {
        let server = start_server(local_config()).await;
        let mut alice = TestClient::join(&server, 1, "Alice").await;
        let mut bob = TestClient::join(&server, 2, "Bob").await;
        let ctx = Arc::clone(server.context());

        let target = ctx
            .slots()
            .client(alice.slot_id)
            .and_then(|slot| slot.connection())
            .unwrap();
        ctx.kick(&target, KickReason::Kicked, "testing", Some("admin".into()));

        let frame = alice.next_frame(PacketId::KickCar).await;
        let kick = KickCar::decode(&mut PacketReader::new(&frame[1..])).unwrap();
        assert_eq!(kick.slot_id, alice.slot_id);
        assert_eq!(kick.reason, KickReason::Kicked);

        let frame = bob.next_frame(PacketId::CarDisconnected).await;
        let gone = CarDisconnected::decode(&mut PacketReader::new(&frame[1..])).unwrap();
        assert_eq!(gone.slot_id, alice.slot_id);
        wait_until(|| ctx.slots().connected_count() == 1).await;
    }

    /// Tests that a banned guid cannot come back
    #[tokio::test]
    async fn banned_driver_is_blacklisted_on_return() {
        let server = start_server(local_config()).await;
        let alice = TestClient::join(&server, 77, "Alice").await;
        let ctx = Arc::clone(server.context());

        let target = ctx
            .slots()
            .client(alice.slot_id)
            .and_then(|slot| slot.connection())
            .unwrap();
        ctx.ban(&target, "testing", None);
        wait_until(|| ctx.slots().connected_count() == 0).await;

        let (_reader, _writer, frame) = handshake(&server, &request(77, "Alice")).await;
        assert_eq!(
            HandshakeRejection::from_frame(&frame).unwrap(),
            HandshakeRejection::Blacklisted
        );
    }

    /// Tests that shutdown closes every client stream
    #[tokio::test]
    async fn shutdown_closes_client_streams() {
        let server = start_server(local_config()).await;
        let mut alice = TestClient::join(&server, 1, "Alice").await;

        server.shutdown();
        let closed = timeout(WAIT, async {
            loop {
                if read_frame(&mut alice.reader, &frames()).await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }
}
