// In: benches/slice_plan_bench.rs

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::{ArrayD, IxDyn};

use sliceflow::data::pattern::names::{PROJECTION, SINOGRAM};
use sliceflow::data::{plan, Dataset, Pattern};

// --- Mock data ---

/// A (angles, rows, columns) volume filled with a deterministic ramp.
fn generate_volume(shape: &[usize]) -> ArrayD<f64> {
    let n: usize = shape.iter().product();
    ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|v| (v % 251) as f64).collect())
        .unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)))
}

// --- Benchmark Suite ---

const VOLUME: [usize; 3] = [180, 64, 64];
const WORKERS: usize = 8;

fn bench_slice_plans(c: &mut Criterion) {
    let projection = Pattern::new(PROJECTION, &[1, 2], &[0], 3).unwrap();
    let sinogram = Pattern::new(SINOGRAM, &[0, 2], &[1], 3).unwrap();
    let many_slices = Pattern::new("PIXEL", &[], &[0, 1, 2], 3).unwrap();

    let mut group = c.benchmark_group("Slice Planning");
    group.bench_function("Plan [1] Projection", |b| {
        b.iter(|| black_box(plan(black_box(&VOLUME), &projection, WORKERS)))
    });
    group.bench_function("Plan [2] Sinogram", |b| {
        b.iter(|| black_box(plan(black_box(&VOLUME), &sinogram, WORKERS)))
    });
    group.bench_function("Plan [3] Every Element Padded", |b| {
        b.iter(|| black_box(plan(black_box(&VOLUME), &many_slices, WORKERS).map(|p| p.with_padding(2))))
    });
    group.finish();
}

fn bench_chunk_access(c: &mut Criterion) {
    let mut volume = Dataset::from_array("volume", generate_volume(&VOLUME));
    volume.declare_pattern(PROJECTION, &[1, 2], &[0]).unwrap();
    volume.declare_pattern(SINOGRAM, &[0, 2], &[1]).unwrap();
    let projection_plan = plan(&VOLUME, volume.get_pattern(PROJECTION).unwrap(), 1).unwrap();
    let sinogram_plan = plan(&VOLUME, volume.get_pattern(SINOGRAM).unwrap(), 1).unwrap();
    let padded = projection_plan.with_padding(2);

    let mut group = c.benchmark_group("Chunk Access");
    group.throughput(criterion::Throughput::Elements((VOLUME[1] * VOLUME[2]) as u64));

    group.bench_function("Read [1] Projection", |b| {
        b.iter(|| black_box(volume.read_chunk(PROJECTION, projection_plan.index(90))))
    });
    group.bench_function("Read [2] Sinogram (strided)", |b| {
        b.iter(|| black_box(volume.read_chunk(SINOGRAM, sinogram_plan.index(32))))
    });
    group.bench_function("Read [3] Padded Projection Neighbourhood", |b| {
        b.iter(|| black_box(volume.read_neighbourhood(PROJECTION, &padded, 90)))
    });
    group.finish();
}

// These two lines generate the main function and register the benchmark groups.
criterion_group!(benches, bench_slice_plans, bench_chunk_access);
criterion_main!(benches);
