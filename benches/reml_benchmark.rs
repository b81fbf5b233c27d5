use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use ndarray::{Array1, Array2};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use svca::data::ExpressionData;
use svca::kernel::SpectralMixture;
use svca::model::{ModelParameters, SvcaData, VarianceComponentModel};
use svca::optimizer::{MultiStartOptimizer, OptimizerConfig};
use svca::score_test::ScoreTest;

const GENES: usize = 30;

fn random_data(n: usize) -> Arc<SvcaData> {
    let mut rng = StdRng::seed_from_u64(0x5EED_F64 + n as u64);
    let coords = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0..20.0));
    let counts = Array2::from_shape_fn((n, GENES), |_| {
        let z: f64 = rng.sample(Standard);
        (z + 3.0).max(0.0).exp().round()
    });
    let names = (0..GENES).map(|g| format!("gene{g}")).collect();
    let expression = ExpressionData::new(counts, names).expect("valid counts");
    Arc::new(SvcaData::new(&expression, coords, Array1::ones(n)).expect("valid inputs"))
}

fn benchmark_reml(c: &mut Criterion) {
    let sizes = [50_usize, 100, 200];
    let mut group = c.benchmark_group("svca");
    for &size in &sizes {
        let data = random_data(size);
        let kernel = SpectralMixture::geometric(data.cache(), 1, false).expect("bounds");

        let mut model = VarianceComponentModel::new(data.clone(), ModelParameters::new(kernel.clone()))
            .expect("model");
        model.use_interactions(true);
        let raw = model.trainable_raw();
        group.bench_with_input(BenchmarkId::new("reml_gradient", size), &raw, |b, input| {
            b.iter(|| {
                let value = model.negative_reml_and_gradient(black_box(input));
                black_box(value).ok();
            });
        });

        let optimizer = MultiStartOptimizer::new(OptimizerConfig::default());
        let mut test = ScoreTest::new(data, kernel, optimizer).expect("score test");
        group.bench_function(BenchmarkId::new("score_test", size), |b| {
            b.iter(|| {
                let result = test.call(black_box(1), None);
                black_box(result).ok();
            });
        });
    }
    group.finish();
}

criterion_group!(reml, benchmark_reml);
criterion_main!(reml);
