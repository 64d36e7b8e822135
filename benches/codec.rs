//! 패킷 코덱 벤치마크

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use rudp::packet::{
    AckPacket, AckStatistics, ConnectionType, ControlHeader, DataPacket, HandshakePacket,
    MessagePosition, SOCKET_TYPE_DATAGRAM,
};
use rudp::{MessageNumber, Packet, SequenceNumber, MAX_PACKET_SIZE, PROTOCOL_VERSION};

fn data_packet() -> Packet {
    Packet::Data(DataPacket {
        sequence_number: SequenceNumber::new(123_456),
        position: MessagePosition::Solo,
        in_order: true,
        message_number: MessageNumber::new(77),
        timestamp: 1_000,
        destination_socket_id: 0xDEAD_BEEF,
        payload: Bytes::from(vec![0xABu8; MAX_PACKET_SIZE - 16]),
    })
}

fn ack_packet() -> Packet {
    Packet::Ack(AckPacket {
        header: ControlHeader::new(2_000, 0xDEAD_BEEF),
        ack_sequence_number: 9,
        packet_sequence_number: SequenceNumber::new(123_456),
        optional: Some(AckStatistics {
            round_trip_time: 10_000,
            round_trip_time_variance: 2_500,
            available_buffer_size: 8192,
            packets_receiving_rate: 50_000,
            estimated_link_capacity: 80_000,
        }),
    })
}

fn handshake_packet() -> Packet {
    Packet::Handshake(HandshakePacket {
        header: ControlHeader::new(0, 0),
        version: PROTOCOL_VERSION,
        socket_type: SOCKET_TYPE_DATAGRAM,
        initial_sequence_number: SequenceNumber::new(42),
        maximum_packet_size: MAX_PACKET_SIZE as u32,
        maximum_flow_window_size: 8192,
        connection_type: ConnectionType::Request,
        socket_id: 0x1234_5678,
        syn_cookie: 0,
        peer_endpoint: "[2001:db8::7]:5483".parse().unwrap(),
    })
}

fn bench_codec(c: &mut Criterion) {
    let cases = [
        ("data", data_packet()),
        ("ack", ack_packet()),
        ("handshake", handshake_packet()),
    ];

    for (name, packet) in cases.iter() {
        let mut group = c.benchmark_group(*name);
        group.throughput(Throughput::Bytes(packet.encoded_len() as u64));

        group.bench_function("encode", |b| {
            let mut buf = BytesMut::with_capacity(MAX_PACKET_SIZE);
            b.iter(|| {
                buf.clear();
                black_box(packet.encode(&mut buf));
            })
        });

        let encoded = packet.to_bytes();
        group.bench_function("decode", |b| {
            b.iter(|| black_box(Packet::decode(black_box(&encoded)).unwrap()))
        });

        group.finish();
    }
}

criterion_group!(benches, bench_codec);
criterion_main!(benches);
