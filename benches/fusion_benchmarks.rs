//! Fusion and resolution throughput over synthetic screens.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::hint::black_box;
use vmpilot::config::{ResolverConfig, VisionConfig};
use vmpilot::vision::{FrameId, ObservationNormalizer, RawBox, RawDetection, RawTextBox};
use vmpilot::{FusionEngine, Resolver};

/// A form-like screen: `rows` rows of caption, input field and button.
fn synthetic_screen(rows: usize) -> (Vec<RawDetection>, Vec<RawTextBox>) {
    let mut detections = Vec::with_capacity(rows * 2);
    let mut texts = Vec::with_capacity(rows * 2);
    for row in 0..rows {
        let y = 40.0 * row as f64;
        detections.push(RawDetection {
            bbox: RawBox::Xywh { x: 160.0, y, w: 240.0, h: 28.0 },
            label: "text_field".into(),
            confidence: 0.8,
        });
        detections.push(RawDetection {
            bbox: RawBox::Xyxy { x1: 420.0, y1: y, x2: 500.0, y2: y + 30.0 },
            label: "button".into(),
            confidence: 0.85,
        });
        texts.push(RawTextBox {
            bbox: RawBox::Xywh { x: 10.0, y: y + 4.0, w: 120.0, h: 20.0 },
            text: format!("Field {row}"),
            confidence: 0.9,
        });
        texts.push(RawTextBox {
            bbox: RawBox::Xywh { x: 430.0, y: y + 5.0, w: 60.0, h: 20.0 },
            text: format!("Save {row}"),
            confidence: 0.9,
        });
    }
    (detections, texts)
}

fn bench_fusion(c: &mut Criterion) {
    let config = VisionConfig::default();
    let normalizer = ObservationNormalizer::new(config.min_confidence);
    let engine = FusionEngine::new(&config);
    let mut group = c.benchmark_group("fuse");
    for rows in [10, 50, 200] {
        let (detections, texts) = synthetic_screen(rows);
        group.bench_with_input(BenchmarkId::from_parameter(rows), &rows, |b, _| {
            b.iter(|| {
                let outcome = normalizer.normalize(FrameId(1), &detections, &texts);
                black_box(engine.fuse(&outcome.observations))
            });
        });
    }
    group.finish();
}

fn bench_resolution(c: &mut Criterion) {
    let config = VisionConfig::default();
    let (detections, texts) = synthetic_screen(200);
    let outcome = ObservationNormalizer::new(config.min_confidence).normalize(FrameId(1), &detections, &texts);
    let elements = FusionEngine::new(&config).fuse(&outcome.observations);
    let resolver = Resolver::new(&config, &ResolverConfig::default());

    let mut group = c.benchmark_group("resolve");
    for description in ["Save 150", "field 199 input", "sav 42 buton", "nothing like this"] {
        group.bench_with_input(BenchmarkId::from_parameter(description), &description, |b, d| {
            b.iter(|| black_box(resolver.resolve_elements(d, &elements)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fusion, bench_resolution);
criterion_main!(benches);
