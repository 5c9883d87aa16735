//! Performance benchmarks for netnext-core.
//!
//! Run with: `cargo bench -p netnext-core`

use std::net::SocketAddr;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use netnext_core::packets::{FallbackFlags, SessionResponsePacket, SessionUpdatePacket};
use netnext_core::routing::{
    InternalConfig, LowestCostDecider, MatrixRelay, RouteDecider, RouteInputs, RouteMatrix,
    RouteShader, RouteState,
};
use netnext_core::tokens::{RouteHops, build_continue_tokens, build_next_tokens};
use netnext_core::{ENCRYPTED_ROUTE_TOKEN_SIZE, Packet, RouteType, SdkVersion, SessionData};
use netnext_crypto::x25519::PrivateKey;
use rand_core::OsRng;

fn sample_update() -> SessionUpdatePacket {
    let mut packet = SessionUpdatePacket {
        version: SdkVersion::new(4, 0, 10),
        buyer_id: 0xAAAA_BBBB_CCCC_DDDD,
        datacenter_id: 0x1234,
        session_id: 0xDEAD_BEEF_0000_0001,
        slice_number: 12,
        session_data: vec![13; 200],
        client_address: Some("198.51.100.4:50000".parse().unwrap()),
        server_address: Some("203.0.113.10:40000".parse().unwrap()),
        user_hash: 77,
        platform_type: 3,
        connection_type: 1,
        next: true,
        committed: true,
        flags: FallbackFlags::ROUTE_EXPIRED,
        direct_rtt: 60.0,
        next_rtt: 40.0,
        num_near_relays: 32,
        next_kbps_up: 256,
        next_kbps_down: 512,
        packets_sent_client_to_server: 1000,
        packets_sent_server_to_client: 1000,
        ..SessionUpdatePacket::default()
    };
    for i in 0..32 {
        packet.near_relay_ids[i] = i as u64 + 1;
        packet.near_relay_rtt[i] = 20 + i as i32;
    }
    packet
}

fn hops(relays: usize) -> RouteHops {
    let nodes = relays + 2;
    RouteHops {
        addresses: (0..nodes)
            .map(|i| SocketAddr::from(([10, 0, 0, i as u8], 40000)))
            .collect(),
        public_keys: (0..nodes)
            .map(|_| PrivateKey::generate(&mut OsRng).public_key())
            .collect(),
    }
}

fn matrix(size: usize) -> RouteMatrix {
    let relays = (0..size)
        .map(|i| MatrixRelay {
            id: i as u64 + 1,
            addr: SocketAddr::from(([10, 0, (i / 256) as u8, (i % 256) as u8], 40000)),
            name: format!("relay.{i}"),
            latitude: 40.0,
            longitude: -74.0,
            datacenter_id: (i % 8) as u64,
        })
        .collect();
    let mut matrix = RouteMatrix::new(relays, 0);
    for i in 0..size as i32 {
        for j in 0..i {
            matrix.add_route(20 + (i + j) % 40, &[i, j]);
            if i > j + 1 {
                matrix.add_route(25 + (i * j) % 40, &[i, j + 1, j]);
            }
        }
    }
    matrix
}

// ============================================================================
// Packet Benchmarks
// ============================================================================

fn bench_session_update(c: &mut Criterion) {
    let bytes = sample_update().marshal().unwrap();

    let mut group = c.benchmark_group("session_update");
    group.throughput(Throughput::Bytes(bytes.len() as u64));
    group.bench_function("unmarshal", |b| {
        b.iter(|| SessionUpdatePacket::unmarshal(black_box(&bytes)))
    });
    let packet = sample_update();
    group.bench_function("marshal", |b| b.iter(|| black_box(&packet).marshal()));
    group.finish();
}

fn bench_session_response(c: &mut Criterion) {
    let response = SessionResponsePacket {
        version: SdkVersion::new(4, 0, 10),
        session_id: 1,
        slice_number: 12,
        session_data: vec![13; 200],
        route_type: RouteType::New,
        num_tokens: 7,
        tokens: vec![0x11; 7 * ENCRYPTED_ROUTE_TOKEN_SIZE],
        ..SessionResponsePacket::default()
    };

    c.bench_function("session_response_marshal_framed", |b| {
        b.iter(|| black_box(&response).marshal_framed())
    });
}

fn bench_session_data(c: &mut Criterion) {
    let mut data = SessionData {
        session_id: 0xDEAD_BEEF,
        slice_number: 40,
        expire_timestamp: 1_700_000_000,
        ..SessionData::default()
    };
    data.set_route(&[1, 2, 3], 45);
    let bytes = data.marshal().unwrap();

    c.bench_function("session_data_marshal", |b| b.iter(|| black_box(&mut data).marshal()));
    c.bench_function("session_data_unmarshal", |b| {
        b.iter(|| SessionData::unmarshal(black_box(&bytes)))
    });
}

// ============================================================================
// Token Benchmarks
// ============================================================================

fn bench_tokens(c: &mut Criterion) {
    let router = PrivateKey::generate(&mut OsRng);
    let mut group = c.benchmark_group("route_tokens");

    for relays in [1, 3, 5] {
        let hops = hops(relays);
        let mut data = SessionData::default();
        group.bench_with_input(BenchmarkId::new("next", relays), &hops, |b, hops| {
            b.iter(|| build_next_tokens(&mut data, black_box(hops), 1024, 1024, &router))
        });
        group.bench_with_input(BenchmarkId::new("continue", relays), &hops, |b, hops| {
            b.iter(|| build_continue_tokens(&data, black_box(hops), &router))
        });
    }

    group.finish();
}

// ============================================================================
// Route Decision Benchmarks
// ============================================================================

fn bench_take_network_next(c: &mut Criterion) {
    let shader = RouteShader::default();
    let internal = InternalConfig::default();
    let decider = LowestCostDecider::new();
    let mut group = c.benchmark_group("take_network_next");

    for size in [32, 128, 512] {
        let matrix = matrix(size);
        let source_relays: Vec<i32> = (0..32).collect();
        let source_relay_cost: Vec<i32> = (0..32).map(|i| 5 + i % 20).collect();
        let dest_relays: Vec<i32> = matrix
            .datacenter_relays(3)
            .iter()
            .filter_map(|id| matrix.relay_index(*id))
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(size), &matrix, |b, matrix| {
            b.iter(|| {
                let inputs = RouteInputs {
                    matrix,
                    route_shader: &shader,
                    internal: &internal,
                    multipath_vetoed: false,
                    direct_latency: 150,
                    next_latency: 0,
                    predicted_latency: 0,
                    direct_packet_loss: 0.0,
                    next_packet_loss: 0.0,
                    source_relays: &source_relays,
                    source_relay_cost: &source_relay_cost,
                    dest_relays: &dest_relays,
                };
                let mut state = RouteState::default();
                decider.take_network_next(black_box(&inputs), &mut state, &mut None)
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_session_update,
    bench_session_response,
    bench_session_data,
    bench_tokens,
    bench_take_network_next,
);
criterion_main!(benches);
