//! Headless client for manual smoke testing.
//!
//! Connects over TCP, performs a handshake, binds its UDP endpoint, answers
//! the checksum request and then drives a parked car while logging whatever
//! the server broadcasts.

use clap::Parser;
use log::{debug, info, warn};
use shared::framing::{read_frame, write_frame, FrameConfig};
use shared::handshake::{HandshakeRejection, HandshakeRequest, HandshakeResponse};
use shared::packets::{
    decode_batched, CarConnect, CarConnected, CarDisconnected, ChatMessage, ChecksumReport,
    CurrentSessionUpdate, KickCar, LapCompletedOut, PingPong, PingUpdate,
};
use shared::{
    to_bytes, Decode, PacketId, PacketReader, PositionUpdateIn, PositionUpdateOut, Vector3,
    MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{interval, Duration};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Server TCP address
    #[arg(short, long, default_value = "127.0.0.1:9600")]
    server: SocketAddr,
    #[arg(short, long, default_value = "smoke")]
    name: String,
    #[arg(long, default_value = "ks_mazda_mx5_cup")]
    car: String,
    #[arg(long, default_value = "76561198000000000")]
    guid: u64,
    #[arg(long, default_value = "")]
    password: String,
    /// File with one hex MD5 per line, in the order the server lists paths
    #[arg(long)]
    checksums: Option<PathBuf>,
    /// Telemetry updates per second
    #[arg(long, default_value = "10")]
    rate: u32,
}

fn parse_hex(line: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let line = line.trim();
    if line.len() % 2 != 0 {
        return Err(format!("odd-length hex string: {}", line).into());
    }
    (0..line.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&line[i..i + 2], 16).map_err(Into::into))
        .collect()
}

/// Concatenates every hash in the file. Without a file, sends zeros for each
/// requested path plus the car hash.
fn checksum_payload(file: Option<&Path>, expected_paths: usize) -> Result<Vec<u8>, Box<dyn Error>> {
    match file {
        Some(path) => {
            let mut payload = Vec::new();
            for line in std::fs::read_to_string(path)?.lines() {
                if !line.trim().is_empty() {
                    payload.extend(parse_hex(line)?);
                }
            }
            Ok(payload)
        }
        None => Ok(vec![0u8; (expected_paths + 1) * 16]),
    }
}

fn log_frame(frame: &[u8]) -> Result<(), Box<dyn Error>> {
    let mut reader = PacketReader::new(frame);
    let tag = reader.read_u8()?;
    match PacketId::try_from(tag) {
        Ok(PacketId::Chat) => {
            let chat = ChatMessage::decode(&mut reader)?;
            info!("[chat] slot {}: {}", chat.slot_id, chat.message);
        }
        Ok(PacketId::CarConnected) => {
            let car = CarConnected::decode(&mut reader)?;
            info!("Car {} connected: {} ({})", car.slot_id, car.name, car.nation);
        }
        Ok(PacketId::CarDisconnected) => {
            info!("Car {} disconnected", CarDisconnected::decode(&mut reader)?.slot_id);
        }
        Ok(PacketId::LapCompleted) => {
            let lap = LapCompletedOut::decode(&mut reader)?;
            info!(
                "Lap from slot {}: {} ms, {} rows in standings",
                lap.slot_id,
                lap.lap_time,
                lap.standings.len()
            );
        }
        Ok(PacketId::CurrentSessionUpdate) => {
            let update = CurrentSessionUpdate::decode(&mut reader)?;
            info!(
                "Session {} ({:?}), grid {:?}",
                update.session.name, update.session.session_type, update.grid
            );
        }
        Ok(PacketId::KickCar) => {
            let kick = KickCar::decode(&mut reader)?;
            warn!("Slot {} kicked: {:?}", kick.slot_id, kick.reason);
        }
        Ok(id) => debug!("Frame {:?}, {} bytes", id, frame.len()),
        Err(_) => debug!("Unknown frame tag 0x{:02X}", tag),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let started = Instant::now();
    let frames = FrameConfig {
        max_payload_size: u16::MAX,
    };

    let stream = TcpStream::connect(args.server).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    info!("Connected to {}", args.server);

    let request = HandshakeRequest {
        client_version: PROTOCOL_VERSION,
        guid: args.guid,
        name: args.name.clone(),
        team: String::new(),
        nation: "ITA".into(),
        requested_car: args.car.clone(),
        password: args.password.clone(),
        features: Vec::new(),
    };
    write_frame(&mut writer, &to_bytes(&request)?, &frames).await?;

    let frame = read_frame(&mut reader, &frames).await?;
    if frame.first() != Some(&u8::from(PacketId::NewCarConnection)) {
        let rejection = HandshakeRejection::from_frame(&frame)?;
        warn!("Handshake rejected: {:?}", rejection);
        return Ok(());
    }
    let response = HandshakeResponse::decode(&mut PacketReader::new(&frame[1..]))?;
    info!(
        "Accepted into slot {} on {} ({} checksum paths)",
        response.slot_id,
        response.track_name,
        response.checksum_paths.len()
    );

    let udp = UdpSocket::bind("0.0.0.0:0").await?;
    let udp_target = SocketAddr::new(args.server.ip(), response.udp_port);
    udp.send_to(
        &to_bytes(&CarConnect {
            slot_id: response.slot_id,
        })?,
        udp_target,
    )
    .await?;

    let payload = checksum_payload(args.checksums.as_deref(), response.checksum_paths.len())?;
    write_frame(&mut writer, &to_bytes(&ChecksumReport { payload })?, &frames).await?;

    let mut telemetry = interval(Duration::from_millis(1000 / args.rate.max(1) as u64));
    let mut update = PositionUpdateIn {
        position: Vector3::new(0.0, 0.0, 0.0),
        gas: 0,
        ..Default::default()
    };
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];

    // Frame reads are not cancel safe, so the stream gets its own task.
    let mut stream_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, &frames).await {
                Ok(frame) => {
                    if let Err(e) = log_frame(&frame) {
                        warn!("Undecodable frame: {}", e);
                    }
                }
                Err(e) => {
                    info!("Stream closed: {}", e);
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut stream_task => break,
            received = udp.recv_from(&mut buf) => {
                let (len, _) = received?;
                let datagram = &buf[..len];
                let mut reader = PacketReader::new(datagram);
                match PacketId::try_from(reader.read_u8()?) {
                    Ok(PacketId::PingUpdate) => {
                        let ping = PingUpdate::decode(&mut reader)?;
                        debug!("Ping {} ms", ping.ping);
                        let pong = PingPong {
                            server_time: ping.server_time,
                            client_time: started.elapsed().as_millis() as u32,
                        };
                        udp.send_to(&to_bytes(&pong)?, udp_target).await?;
                    }
                    Ok(PacketId::PositionUpdate) => {
                        let car: PositionUpdateOut = reader.read_struct()?;
                        debug!("Car {} at {:?}", car.session_id, car.position);
                    }
                    Ok(PacketId::Extended) => {
                        for car in decode_batched(datagram)? {
                            debug!("Car {} at {:?}", car.session_id, car.position);
                        }
                    }
                    Ok(id) => debug!("Datagram {:?}, {} bytes", id, len),
                    Err(e) => debug!("Unknown datagram: {}", e),
                }
            }
            _ = telemetry.tick() => {
                update.pak_sequence_id = update.pak_sequence_id.wrapping_add(1);
                update.timestamp = started.elapsed().as_millis() as u32;
                udp.send_to(&to_bytes(&update)?, udp_target).await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    Ok(())
}
