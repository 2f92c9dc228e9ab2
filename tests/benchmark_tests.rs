//! Performance benchmarks for the hot paths of the racing server

use server::broadcast::BroadcastEngine;
use server::checksum::ChecksumManifest;
use server::config::{EntryConfig, ServerConfig};
use server::context::ServerContext;
use server::services::Services;
use shared::packets::{BatchedPositionUpdate, LapCompletedIn, LegacyPositionUpdate};
use shared::{
    to_bytes, Decode, PacketReader, PositionUpdateIn, PositionUpdateOut, Vector3,
    POSITION_BATCH_SIZE,
};
use std::time::Instant;

fn sample_update(i: usize) -> PositionUpdateOut {
    PositionUpdateOut {
        session_id: (i % 32) as u8,
        pak_sequence_id: i as u8,
        timestamp: i as u32,
        ping: 40,
        position: Vector3::new(i as f32, 1.5, -(i as f32)),
        velocity: Vector3::new(20.0, 0.0, 5.0),
        engine_rpm: 6500,
        gear: 4,
        gas: 200,
        ..Default::default()
    }
}

fn context(config: ServerConfig) -> std::sync::Arc<ServerContext> {
    let services = Services::in_memory(config.sun_angle, config.track_grip);
    ServerContext::new(config, services, ChecksumManifest::new()).unwrap()
}

/// Benchmarks encoding single-car position datagrams
#[test]
fn benchmark_legacy_position_encoding() {
    let update = sample_update(7);
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = to_bytes(&LegacyPositionUpdate(&update)).unwrap();
        assert_eq!(bytes.len(), 61);
    }

    let duration = start.elapsed();
    println!(
        "Legacy position encoding: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    // Well within one tick for any realistic grid
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks encoding full batches of car updates
#[test]
fn benchmark_batched_position_encoding() {
    let batch: Vec<PositionUpdateOut> = (0..POSITION_BATCH_SIZE).map(sample_update).collect();
    let iterations = 10_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let bytes = to_bytes(&BatchedPositionUpdate { entries: &batch }).unwrap();
        assert_eq!(bytes.len(), 3 + 60 * POSITION_BATCH_SIZE);
    }

    let duration = start.elapsed();
    println!(
        "Batched position encoding: {} batches in {:?} ({:.2} μs/batch)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks decoding incoming telemetry datagrams
#[test]
fn benchmark_telemetry_decoding() {
    let update = PositionUpdateIn {
        pak_sequence_id: 3,
        timestamp: 123_456,
        position: Vector3::new(100.0, 2.0, -50.0),
        velocity: Vector3::new(30.0, 0.0, 0.0),
        gas: 255,
        normalized_position: 0.5,
        ..Default::default()
    };
    let datagram = to_bytes(&update).unwrap();
    let iterations = 100_000;
    let start = Instant::now();

    for _ in 0..iterations {
        let decoded = PositionUpdateIn::decode(&mut PacketReader::new(&datagram[1..])).unwrap();
        assert!(decoded.is_valid());
    }

    let duration = start.elapsed();
    println!(
        "Telemetry decoding: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks checksum verification against a large track manifest
#[test]
fn benchmark_checksum_verification() {
    let mut manifest = ChecksumManifest::new();
    for i in 0..40u8 {
        manifest.add_track_file(format!("content/tracks/test/{}.kn5", i), [i; 16]);
    }
    manifest.add_car_checksum("ks_mazda_mx5_cup", [0xAA; 16]);

    let mut payload: Vec<u8> = (0..40u8).flat_map(|i| [i; 16]).collect();
    payload.extend_from_slice(&[0xAA; 16]);

    let iterations = 50_000;
    let start = Instant::now();

    for _ in 0..iterations {
        assert!(manifest.verify("ks_mazda_mx5_cup", &payload));
    }

    let duration = start.elapsed();
    println!(
        "Checksum verification: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(duration.as_millis() < 2000);
}

/// Benchmarks ticking a grid of AI pools
#[test]
fn benchmark_ai_tick() {
    let mut config = ServerConfig::default();
    config.entries = (0..64).map(|_| EntryConfig::ai("ks_mazda_mx5_cup")).collect();
    config.extra.ai_instances_per_slot = 4;
    let ctx = context(config);
    let mut engine = BroadcastEngine::new(ctx);

    let iterations = 1_000;
    let start = Instant::now();

    for tick in 0..iterations {
        engine.tick(tick * 55);
    }

    let duration = start.elapsed();
    println!(
        "AI tick: {} ticks over 64 slots in {:?} ({:.2} μs/tick)",
        iterations,
        duration,
        duration.as_micros() as f64 / iterations as f64
    );

    // One tick must fit comfortably in an 18 Hz period
    assert!(duration.as_millis() < 1000);
}

/// Benchmarks lap processing and standings ordering for a full grid
#[test]
fn benchmark_lap_standings() {
    let mut config = ServerConfig::default();
    config.entries = (0..32).map(|_| EntryConfig::client("ks_mazda_mx5_cup")).collect();
    let ctx = context(config);
    let sessions = ctx.sessions();

    let start = Instant::now();
    for lap in 0..50u32 {
        for slot in 0..32u8 {
            let report = LapCompletedIn {
                timestamp: lap * 90_000,
                lap_time: 90_000 + slot as u32 * 10 + lap,
                cuts: 0,
            };
            assert!(sessions.on_lap_completed(slot, &report, 50, lap as i64 * 90_000));
        }
    }

    let iterations = 10_000;
    for _ in 0..iterations {
        let standings = sessions.standings();
        assert_eq!(standings.len(), 32);
    }

    let duration = start.elapsed();
    println!(
        "Lap standings: 1600 laps and {} orderings in {:?}",
        iterations, duration
    );

    assert!(duration.as_millis() < 3000);
    assert_eq!(sessions.standings()[0].slot_id, 0);
}
