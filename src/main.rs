//! Grid GP CLI - Run symbolic regression from a JSON run file.

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use gridgp::{
    compute::{RegressionFitness, Sample},
    evolution::EvolutionScheduler,
    grid::{BestFitObserver, IndividualSnapshot},
    schema::EngineConfig,
};

/// Engine configuration plus the regression data set.
#[derive(Debug, Serialize, Deserialize)]
struct RunFile {
    #[serde(default)]
    config: EngineConfig,
    samples: Vec<Sample>,
}

#[derive(Debug, Serialize)]
struct Report {
    manager_id: u32,
    reproductions: u64,
    population: usize,
    elapsed_secs: f64,
    best: Vec<IndividualSnapshot>,
}

fn main() {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <run.json> [timeout_secs]", args[0]);
        eprintln!();
        eprintln!("Evolve expressions fitting the samples of a JSON run file.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  run.json      Engine configuration and regression samples");
        eprintln!("  timeout_secs  Stop the run after this many seconds (default: 300)");
        eprintln!();
        eprintln!("An example run file is printed with the --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_run();
        return;
    }

    let run_path = PathBuf::from(&args[1]);
    let timeout_secs: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(300);

    let run_str = fs::read_to_string(&run_path).unwrap_or_else(|e| {
        eprintln!("Error reading run file: {}", e);
        std::process::exit(1);
    });

    let run: RunFile = serde_json::from_str(&run_str).unwrap_or_else(|e| {
        eprintln!("Error parsing run file: {}", e);
        std::process::exit(1);
    });

    let fitness = RegressionFitness::new(run.samples).unwrap_or_else(|e| {
        eprintln!("Error in samples: {}", e);
        std::process::exit(1);
    });

    let config = run.config;
    println!("Grid GP");
    println!("=======");
    println!(
        "Grid: {}x{} (spread {}x{})",
        config.grid.size_x, config.grid.size_y, config.grid.spread_x, config.grid.spread_y
    );
    println!("Dimensions: {}", config.num_dofs);
    println!("Workers: {}", config.process.num_workers);
    println!("Reproductions: {}", config.process.max_reproductions);
    println!("Samples: {}", fitness.samples().len());
    println!();

    let observer = Arc::new(BestFitObserver::new());
    let scheduler = EvolutionScheduler::new(config, Arc::new(fitness), observer)
        .unwrap_or_else(|e| {
            eprintln!("Error creating engine: {}", e);
            std::process::exit(1);
        })
        .with_callback(|s| {
            log::info!("Manager {} finished", s.manager_id());
        });

    let start = Instant::now();
    if let Err(e) = scheduler.start() {
        eprintln!("Error starting engine: {}", e);
        std::process::exit(1);
    }

    if !scheduler.wait_until_stopped(Duration::from_secs(timeout_secs)) {
        println!("Timeout reached, stopping...");
        scheduler.stop();
        scheduler.wait_until_stopped(Duration::from_millis(
            scheduler.config().process.shutdown_timeout_ms + 1000,
        ));
    }

    let report = Report {
        manager_id: scheduler.manager_id(),
        reproductions: scheduler.reproductions(),
        population: scheduler.coordinator().grid().population(),
        elapsed_secs: start.elapsed().as_secs_f64(),
        best: scheduler
            .best_fit_individuals()
            .iter()
            .map(|i| i.to_snapshot())
            .collect(),
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error serializing report: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_example_run() {
    let samples = (0..21)
        .map(|i| {
            let x = -2.0 + i as f64 * 0.2;
            Sample {
                inputs: vec![x],
                outputs: vec![x * x * x - x + 1.0],
            }
        })
        .collect();
    let run = RunFile {
        config: EngineConfig::default(),
        samples,
    };

    println!("Example run file (run.json):");
    match serde_json::to_string_pretty(&run) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing example: {}", e),
    }
}
