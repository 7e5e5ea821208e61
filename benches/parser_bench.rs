//! Benchmarks for the spot parser and line assembly.

use chrono::Utc;
use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use dxcluster_ingest::{LineAssembler, Mode, SpotParser, ZoneInfo, ZoneTable};

/// Sample cluster lines for benchmarking.
const SAMPLE_LINES: &[&str] = &[
    "DX de VE3EID-#:  14074.00  VE3XYZ         FT8   -05 dB  2345Z",
    "DX de VE3EID-#:   7074.00  JA1ABC         FT8   -18 dB  2345Z",
    "DX de VE3EID-#:  21140.00  PY2XX          FT4   +03 dB  2345Z",
    "DX de VE3EID-#:  28074.00  VK2/G4ABC      FT8   -11 dB  2345Z",
    "DX de K1TTT-#:   14025.0   W1AW           CW     19 dB  22 WPM  CQ  2345Z",
    "DX de VE3EID-#:  10136.00  DL1ABC         FT8   - 7 dB  2345Z",
];

fn parser() -> SpotParser {
    SpotParser::new("VE3EID", [Mode::Ft8, Mode::Ft4])
}

fn bench_parse_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_line");
    let parser = parser();
    let now = Utc::now();

    // Benchmark single line parsing
    group.throughput(Throughput::Elements(1));
    group.bench_function("single", |b| {
        b.iter(|| parser.parse_line(black_box(SAMPLE_LINES[0]), now))
    });

    // Benchmark batch parsing
    group.throughput(Throughput::Elements(SAMPLE_LINES.len() as u64));
    group.bench_function("batch", |b| {
        b.iter(|| {
            for line in SAMPLE_LINES {
                let _ = parser.parse_line(black_box(line), now);
            }
        })
    });

    // Lines from other spotters are rejected before any field parsing
    let other = "DX de K1TTT-#:   14025.0   W1AW   CW   19 dB  22 WPM  CQ  2345Z";
    group.throughput(Throughput::Elements(1));
    group.bench_function("other_spotter", |b| {
        b.iter(|| parser.parse_line(black_box(other), now))
    });

    group.finish();
}

fn bench_zone_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("zone_lookup");

    let prefixes = ["VE", "VE3", "VE7", "JA", "PY", "VK", "VK2", "DL", "G", "W", "K", "K6"];
    let table = ZoneTable::from_entries(prefixes.iter().enumerate().map(|(i, p)| {
        (
            *p,
            ZoneInfo {
                continent: "NA".to_string(),
                country: p.to_string(),
                cq_zone: (i % 40) as u8 + 1,
            },
        )
    }))
    .expect("zone table");

    group.bench_function("trie", |b| {
        b.iter(|| table.resolve(black_box("VE3XYZ")))
    });
    group.bench_function("truncation", |b| {
        b.iter(|| table.resolve_by_truncation(black_box("VE3XYZ")))
    });

    group.finish();
}

fn bench_full_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_pipeline");
    let parser = parser();
    let now = Utc::now();

    // Feed the sample lines in awkward chunk sizes
    let stream: Vec<u8> = SAMPLE_LINES
        .iter()
        .flat_map(|l| l.bytes().chain(*b"\r\n"))
        .collect();

    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("chunked_input", |b| {
        b.iter(|| {
            let mut assembler = LineAssembler::new();
            for chunk in stream.chunks(37) {
                for line in assembler.feed(black_box(chunk)) {
                    let _ = parser.parse_line(&line, now);
                }
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_line,
    bench_zone_lookup,
    bench_full_pipeline
);
criterion_main!(benches);
