use criterion::{criterion_group, criterion_main, Criterion};
use sketchdb_distance::{EditString, EuclideanVector, L1Vector, MetricObject};

fn distance_metrics(c: &mut Criterion) {
    c.bench_function("euclidean_786", |b| {
        let x = EuclideanVector((0..786).map(|_| rand::random()).collect());
        let y = EuclideanVector((0..786).map(|_| rand::random()).collect());
        b.iter(|| std::hint::black_box(x.distance(&y)));
    });
    c.bench_function("l1_786", |b| {
        let x = L1Vector((0..786).map(|_| rand::random()).collect());
        let y = L1Vector((0..786).map(|_| rand::random()).collect());
        b.iter(|| std::hint::black_box(x.distance(&y)));
    });
    c.bench_function("edit_64", |b| {
        let x = EditString("the quick brown fox jumps over the lazy dog again and again".into());
        let y = EditString("a quick brown dog jumps over the lazy fox once and again".into());
        b.iter(|| std::hint::black_box(x.distance(&y)));
    });
}

criterion_group!(benches, distance_metrics,);
criterion_main!(benches);
