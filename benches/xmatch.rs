use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stackphot::spatial::{match_to_catalog, SkyCoord, SkyIndex};

/// Uniform positions in a 2 x 2 degree patch, roughly one DECam chip set.
fn random_patch(n: usize, seed: u64) -> Vec<SkyCoord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| SkyCoord::new(rng.random_range(35.0..37.0), rng.random_range(-5.5..-3.5)))
        .collect()
}

fn bench_match_to_catalog(c: &mut Criterion) {
    let mut group = c.benchmark_group("match_to_catalog");
    for &n in &[1_000usize, 10_000, 50_000] {
        let points = random_patch(n, 1);
        let catalog = random_patch(n, 2);
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| match_to_catalog(black_box(&points), black_box(&catalog)))
        });
    }
    group.finish();
}

fn bench_search_around(c: &mut Criterion) {
    let catalog = random_patch(50_000, 3);
    let index = SkyIndex::new(&catalog);
    let targets = random_patch(1_000, 4);

    let mut group = c.benchmark_group("search_around");
    for &radius in &[1.5f64, 5.0, 30.0] {
        group.bench_with_input(BenchmarkId::from_parameter(radius), &radius, |b, &radius| {
            b.iter(|| {
                targets
                    .iter()
                    .map(|t| index.search_around(black_box(t), radius).len())
                    .sum::<usize>()
            })
        });
    }
    group.finish();
}

fn bench_build_index(c: &mut Criterion) {
    let catalog = random_patch(50_000, 5);
    c.bench_function("build_index_50k", |b| b.iter(|| SkyIndex::new(black_box(&catalog))));
}

criterion_group!(benches, bench_match_to_catalog, bench_search_around, bench_build_index);
criterion_main!(benches);
