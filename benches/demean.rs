use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use hdfe::fixed_effects::{FixedEffect, Groups};
use hdfe::solving::{FixedEffectSolver, SolverMethod, SolverOptions};
use hdfe::AlternatingProjections;
use nalgebra::DVector;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Unbalanced worker/firm panel with `rows` observations.
fn random_panel(rows: usize) -> (Vec<DVector<f64>>, Vec<FixedEffect>) {
    let mut rng = SmallRng::seed_from_u64(0x5EED + rows as u64);
    let workers = rows / 5;
    let firms = rows / 50;
    let worker: Vec<Option<usize>> = (0..rows).map(|i| Some(i % workers)).collect();
    let firm: Vec<Option<usize>> = (0..rows).map(|_| Some(rng.gen_range(0..firms))).collect();
    let columns = (0..4)
        .map(|_| DVector::from_fn(rows, |_, _| rng.sample(StandardNormal)))
        .collect();
    let effects = vec![
        FixedEffect::new(Groups::from_labels(worker)),
        FixedEffect::new(Groups::from_labels(firm)),
    ];
    (columns, effects)
}

fn benchmark_demean(c: &mut Criterion) {
    let mut group = c.benchmark_group("demean");
    for rows in [10_000_usize, 100_000] {
        let (columns, effects) = random_panel(rows);
        let weights = DVector::from_element(rows, 1.0);
        group.throughput(Throughput::Elements((rows * columns.len()) as u64));

        for method in [SolverMethod::Cpu, SolverMethod::Parallel] {
            let solver = AlternatingProjections::new(SolverOptions {
                method,
                ..SolverOptions::default()
            });
            group.bench_with_input(
                BenchmarkId::new(format!("{method:?}"), rows),
                &columns,
                |b, input| {
                    b.iter(|| {
                        let out = solver
                            .residualize(black_box(input.clone()), &effects, &weights)
                            .unwrap();
                        black_box(out);
                    });
                },
            );
        }
    }
    group.finish();
}

criterion_group!(demean, benchmark_demean);
criterion_main!(demean);
