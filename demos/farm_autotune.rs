//! Farm Autotune Example
//!
//! Runs a CPU-bound farm under a contract and prints what the tuner did.
//! With `--simulate` the whole run happens on the simulated machine and
//! completes instantly; otherwise a real rayon farm is tuned through the
//! Linux cpufreq and RAPL interfaces (usually needs root).
//!
//! Run:
//!   cargo run --example farm_autotune --release -- --simulate --tune-throughput 300
//!   cargo run --example farm_autotune --release -- --simulate --tune-utilization 60,85
//!   sudo cargo run --example farm_autotune --release -- --tune-power-budget 40 --tasks 200000

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use clap::Parser;
use tuneloop::sim::{SimulatedMachine, WorkloadModel};
use tuneloop::{
    Farm, Manager, Observer, ParametersBuilder, Summary, SysfsHardware, SystemClock, TickReport,
    Topology, TuneArgs,
};

#[derive(Parser, Debug)]
#[command(about = "Tune a worker farm to a throughput, deadline, power or utilization contract")]
struct Args {
    #[command(flatten)]
    tune: TuneArgs,

    /// Total tasks to run
    #[arg(long, default_value_t = 100_000)]
    tasks: u64,

    /// Approximate cost of one task in microseconds
    #[arg(long, default_value_t = 200)]
    task_us: u64,

    /// Use the simulated machine instead of real hardware
    #[arg(long)]
    simulate: bool,
}

/// Prints one line per tick and the final summary.
struct Printer;

impl Observer for Printer {
    fn on_tick(&mut self, r: &TickReport) {
        println!(
            "{:>8.1}s  {:<40}  {:>9.1} tasks/s  {:>6.1} W  required {:>9.1}  {:?}",
            r.time.as_secs_f64(),
            r.values.to_string(),
            r.smoothed.throughput,
            r.smoothed.watts,
            r.required,
            r.state,
        );
    }

    fn on_summary(&mut self, s: &Summary) {
        let calibration = s.total_calibration();
        println!();
        println!("## Summary");
        println!("- duration: {:.1}s over {} ticks", s.duration.as_secs_f64(), s.ticks);
        println!("- tasks: {:.0}", s.total_tasks);
        println!("- energy: {:.1} J ({:.1} W average)", s.total_joules, s.average_watts());
        println!(
            "- calibrations: {} ({} steps, {:.1}s)",
            s.calibrations.len(),
            calibration.num_steps,
            calibration.duration.as_secs_f64()
        );
        if let Some(values) = &s.last_valid {
            println!("- final configuration: {values}");
        }
        if s.contract_infeasible {
            println!("- the contract could not be met");
        }
        if let Some(reason) = &s.abort_reason {
            println!("- aborted: {reason}");
        }
    }
}

/// Spin for roughly `us` microseconds.
#[inline(never)]
fn calibrated_work(us: u64) -> u64 {
    let iterations = us * 100;
    let mut sum = 0u64;
    for i in 0..iterations {
        sum = sum.wrapping_add(std::hint::black_box(i));
    }
    sum
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let params = ParametersBuilder::new()
        .prefix("autotune")
        .env_prefix("TUNELOOP")
        .with_cli_args(&args.tune)
        .build()?;
    println!("# Contract: {:?}", params.contract);
    println!();

    if args.simulate {
        let machine = SimulatedMachine::new(
            Topology::synthetic(2, 8, 2, vec![1_200_000, 1_600_000, 2_000_000, 2_400_000]),
            WorkloadModel::default().with_total_tasks(args.tasks),
        );
        let mut manager = Manager::new(
            params,
            machine.workers(),
            machine.hardware(),
            machine.clock(),
        )?
        .with_observer(Printer);
        manager.run()?;
        return Ok(());
    }

    let hardware = SysfsHardware::new()?;
    let remaining = Arc::new(AtomicU64::new(args.tasks));
    let task_us = args.task_us;
    let max_workers = std::thread::available_parallelism()?.get();
    let farm = Farm::new(&params.prefix, max_workers, move |_worker| {
        std::hint::black_box(calibrated_work(task_us));
        remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok_and(|before| before > 1)
    })?;
    farm.start();

    let mut manager =
        Manager::new(params, farm, hardware, SystemClock::new())?.with_observer(Printer);
    manager.run()?;
    Ok(())
}
