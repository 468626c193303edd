//! Benchmarks for the explanation numerics.
//!
//! Run with: cargo bench --bench explain_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use dvqa::pipeline::{BoxRecord, PatchPipeline, PatchVqaModel};
use dvqa::prelude::*;

type BenchBackend = NdArray;

fn bench_alignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("ipot_alignment");
    let frame = image::RgbImage::new(224, 224);

    for iterations in [50usize, 200, 1000] {
        let record = synthetic_patch_record(Seed::new(42), 6, PatchGrid::new(12, 16));
        let model = RecordedPatchModel::<BenchBackend>::new(record, Default::default());
        let forward = model.forward(&frame, "how many cars are there").unwrap();
        let pipeline = PatchPipeline::new(
            ExplainConfig::default()
                .with_alignment(AlignmentConfig::default().with_outer_iterations(iterations)),
        );

        group.bench_with_input(BenchmarkId::from_parameter(iterations), &forward, |b, forward| {
            b.iter(|| black_box(pipeline.token_relevance(forward).unwrap()))
        });
    }
    group.finish();
}

fn bench_relevance_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("relevance_rules");
    let record: BoxRecord = synthetic_box_record(Seed::new(7), 8, 36, 640, 480);
    let model = RecordedBoxModel::<BenchBackend>::new(record, Default::default());
    let detector = model.detector();
    let detections = detector.detect(&image::RgbImage::new(640, 480)).unwrap();
    let one_hot =
        dvqa::pipeline::one_hot::<BenchBackend>(0, model.labels().len(), &Default::default())
            .unwrap();
    let capture = model
        .attention_capture("how many cars are there", &detections, one_hot)
        .unwrap();

    for method in RelevanceMethod::presentation_order(RedistributionConfig::default()) {
        group.bench_function(method.kind().display_name(), |b| {
            b.iter(|| black_box(method.accumulate(&capture).unwrap()))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_alignment, bench_relevance_rules);
criterion_main!(benches);
