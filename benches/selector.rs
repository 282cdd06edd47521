//! Benchmarks for model fitting and whole simulated runs.
//!
//! Run with: cargo bench -- selector
//!
//! These benchmarks measure:
//! - Regression fit plus a sweep over every configuration
//! - USL fit and sweep
//! - A complete control loop on the simulated machine per strategy

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tuneloop::predictor::{Predictor, PredictorTarget};
use tuneloop::sim::{SimulatedMachine, WorkloadModel};
use tuneloop::{
    Configuration, Contract, KnobType, Manager, Parameters, PredictionStrategy, Sample, Topology,
};

fn topology() -> Topology {
    Topology::synthetic(
        2,
        8,
        2,
        vec![1_200_000, 1_400_000, 1_600_000, 1_800_000, 2_000_000, 2_200_000, 2_400_000],
    )
}

fn machine(tasks: u64) -> SimulatedMachine {
    SimulatedMachine::new(topology(), WorkloadModel::default().with_total_tasks(tasks))
}

/// Service-time shaped throughput, good enough to train on.
fn synthetic_sample(values: &tuneloop::KnobsValues) -> Sample {
    let cores = values[KnobType::VirtualCores];
    let ghz = values[KnobType::Frequency] / 1e6;
    Sample {
        throughput: 100.0 * cores * ghz / (1.0 + 0.02 * (cores - 1.0)),
        watts: 20.0 + 3.0 * cores * ghz * ghz,
        ..Sample::zero()
    }
}

fn bench_predictor(c: &mut Criterion) {
    let params = Parameters::new().with_contract(Contract::Throughput { target: 500.0 });
    let m = machine(1);
    let configuration = Configuration::new(&params, m.hardware(), 32).unwrap();
    let topology = configuration.topology().clone();
    let combinations = configuration.all_real_combinations().to_vec();
    let training: Vec<_> = combinations.iter().step_by(5).cloned().collect();

    let mut group = c.benchmark_group("selector/predict");
    group.throughput(Throughput::Elements(combinations.len() as u64));

    for strategy in [PredictionStrategy::Regression, PredictionStrategy::Usl] {
        let mut model = Predictor::new(
            strategy,
            PredictorTarget::Throughput,
            &params,
            &configuration,
        )
        .unwrap();
        for values in &training {
            model.refine(values, &synthetic_sample(values), &topology);
        }

        group.bench_function(BenchmarkId::new("fit_and_sweep", format!("{strategy:?}")), |b| {
            b.iter(|| {
                let mut model = model.clone();
                model.prepare(&topology).unwrap();
                let best = combinations
                    .iter()
                    .filter_map(|v| model.predict(v, &topology).ok())
                    .fold(0.0f64, f64::max);
                black_box(best)
            })
        });
    }

    group.finish();
}

fn bench_simulated_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("selector/run");
    group.sample_size(20);

    for strategy in [
        PredictionStrategy::Regression,
        PredictionStrategy::Usl,
        PredictionStrategy::FullSearch,
        PredictionStrategy::LiMartinez,
    ] {
        group.bench_function(BenchmarkId::new("throughput", format!("{strategy:?}")), |b| {
            b.iter(|| {
                let m = machine(200_000);
                let params = Parameters::new()
                    .with_contract(Contract::Throughput { target: 600.0 })
                    .with_prediction(strategy);
                let mut manager =
                    Manager::new(params, m.workers(), m.hardware(), m.clock()).unwrap();
                black_box(manager.run().unwrap())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_predictor, bench_simulated_run);
criterion_main!(benches);
