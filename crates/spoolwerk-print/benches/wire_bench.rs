// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for inbound classification, IPP request parsing and
// payload normalization in the spoolwerk-print crate.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use spoolwerk_print::normalize::{classify, normalize};
use spoolwerk_print::wire::{
    IppResponseBuilder, OP_PRINT_JOB, TAG_OPERATION_ATTRIBUTES, classify_inbound,
    parse_ipp_request,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A Print-Job request carrying `document` as its payload.
fn print_job_request(document: &[u8]) -> Vec<u8> {
    let mut request = IppResponseBuilder::new(OP_PRINT_JOB, 1);
    request
        .begin_group(TAG_OPERATION_ATTRIBUTES)
        .charset("attributes-charset", "utf-8")
        .natural_language("attributes-natural-language", "en")
        .uri("printer-uri", "ipp://localhost:631/printers/Lab")
        .name_attr("requesting-user-name", "alice")
        .name_attr("job-name", "report.txt");
    let mut bytes = request.build();
    bytes.extend_from_slice(document);
    bytes
}

fn text_document(lines: usize) -> Vec<u8> {
    (0..lines)
        .map(|n| format!("line {n}: the quick brown fox jumps over the lazy dog\n"))
        .collect::<String>()
        .into_bytes()
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_parse(c: &mut Criterion) {
    let small = print_job_request(b"hello");
    let large = print_job_request(&vec![0x1B; 1024 * 1024]);

    c.bench_function("parse_ipp_request_small", |b| {
        b.iter(|| parse_ipp_request(black_box(&small)))
    });
    c.bench_function("parse_ipp_request_1mib_payload", |b| {
        b.iter(|| parse_ipp_request(black_box(&large)))
    });
}

fn bench_classify_inbound(c: &mut Criterion) {
    let ipp = print_job_request(b"hello");
    let raw = b"\x1bE\x1b&l0O plain PCL job".to_vec();

    c.bench_function("classify_inbound_ipp", |b| {
        b.iter(|| classify_inbound(black_box(ipp.clone())))
    });
    c.bench_function("classify_inbound_raw", |b| {
        b.iter(|| classify_inbound(black_box(raw.clone())))
    });
}

fn bench_normalize(c: &mut Criterion) {
    let text = text_document(2_000);
    let wrapped = print_job_request(&text);

    c.bench_function("classify_text_payload", |b| {
        b.iter(|| classify(black_box(&text)))
    });
    c.bench_function("normalize_text_to_pcl", |b| {
        b.iter(|| normalize(black_box(&text), Some("HP LaserJet M404dn")))
    });
    c.bench_function("normalize_unwraps_ipp_frame", |b| {
        b.iter(|| normalize(black_box(&wrapped), None))
    });
}

criterion_group!(benches, bench_parse, bench_classify_inbound, bench_normalize);
criterion_main!(benches);
