use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use unet_exchange::packet::{Packet, MAX_ANALOG, MAX_DIGITAL};
use unet_exchange::sequencer::Sequencer;

fn full_packet() -> Packet {
    let mut packet = Packet::new(3001, 1);
    packet.sequence = 1;
    for i in 0..MAX_ANALOG as i64 {
        packet.add_analog(i, i * 10);
    }
    for i in 0..MAX_DIGITAL as i64 {
        packet.add_digital(1000 + i, i % 3 == 0);
    }
    packet
}

fn benchmark_encode(c: &mut Criterion) {
    let mut packet = full_packet();

    c.bench_function("encode_full_packet", |b| {
        b.iter(|| black_box(&mut packet).encode());
    });
}

fn benchmark_decode(c: &mut Criterion) {
    let bytes = full_packet().encode();

    c.bench_function("decode_full_packet", |b| {
        b.iter(|| Packet::decode(black_box(&bytes)));
    });
}

fn benchmark_crc(c: &mut Criterion) {
    let packet = full_packet();

    c.bench_function("section_crcs", |b| {
        b.iter(|| {
            let p = black_box(&packet);
            (p.compute_analog_crc(), p.compute_digital_crc())
        });
    });
}

fn benchmark_sequencer_reorder(c: &mut Criterion) {
    let packets: Vec<Packet> = (1..=1000u32)
        .map(|n| {
            let mut p = Packet::new(3001, 1);
            // swap every adjacent pair to force buffering
            p.sequence = if n % 2 == 1 { n + 1 } else { n - 1 };
            p
        })
        .collect();
    let now = tokio::time::Instant::now();

    c.bench_function("sequencer_1000_swapped_pairs", |b| {
        b.iter(|| {
            let mut seq = Sequencer::new(1000, 100, Duration::from_secs(5));
            let mut out = Vec::with_capacity(packets.len());
            for packet in &packets {
                seq.push(packet.clone(), now, &mut out);
            }
            black_box(out.len())
        });
    });
}

criterion_group!(
    benches,
    benchmark_encode,
    benchmark_decode,
    benchmark_crc,
    benchmark_sequencer_reorder
);
criterion_main!(benches);
