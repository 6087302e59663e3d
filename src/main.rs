// Copyright 2026 QubitOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! QubitOS GST command-line tool
//!
//! Runs iterative long-sequence gate set tomography on simulated data and
//! inspects configuration.
//!
//! # Usage
//!
//! ```bash
//! # Fit a depolarized single-qubit gate set
//! qubit-os-gst simulate --gate-noise 0.1 --samples 1000 --max-lengths 1,2,4,8
//!
//! # Multinomial sampling with a fixed seed
//! qubit-os-gst simulate --seed 7
//!
//! # Show effective configuration
//! qubit-os-gst config --config gst.yaml
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use qubit_os_gst::{
    circuit::make_lsgst_lists,
    config::{Config, LoggingConfig},
    dataset::{generate_data, Sampling},
    stdmodels, IterativeGst, Result, VERSION,
};

/// QubitOS Gate Set Tomography
#[derive(Parser)]
#[command(name = "qubit-os-gst")]
#[command(author = "QubitOS Contributors")]
#[command(version = VERSION)]
#[command(about = "Iterative long-sequence gate set tomography")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit the standard single-qubit model to simulated data
    Simulate {
        /// Depolarizing strength applied to every gate
        #[arg(long, default_value_t = 0.1)]
        gate_noise: f64,

        /// Depolarizing strength applied to the state preparation
        #[arg(long, default_value_t = 0.0)]
        spam_noise: f64,

        /// Shots per circuit
        #[arg(long, default_value_t = 1000)]
        samples: u64,

        /// Seed for multinomial sampling (expected counts when omitted)
        #[arg(long)]
        seed: Option<u64>,

        /// Maximum germ-power lengths, one per iteration
        #[arg(long, value_delimiter = ',', default_value = "1,2,4,8")]
        max_lengths: Vec<usize>,
    },

    /// Show effective configuration
    Config,

    /// Validate configuration file
    Validate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging);

    match cli.command {
        Commands::Simulate {
            gate_noise,
            spam_noise,
            samples,
            seed,
            max_lengths,
        } => {
            config.validate()?;

            let target = stdmodels::std1q_xyi()?;
            let truth = target.depolarize(gate_noise, spam_noise)?;
            let fiducials = stdmodels::fiducials();
            let lists = make_lsgst_lists(&fiducials, &fiducials, &stdmodels::germs(), &max_lengths);
            let all_circuits = lists.last().cloned().unwrap_or_default();

            let sampling = match seed {
                Some(seed) => Sampling::Multinomial { seed },
                None => Sampling::Expected,
            };
            let dataset = generate_data(&truth, &all_circuits, samples, sampling)?;

            info!(
                version = VERSION,
                gate_noise,
                spam_noise,
                samples,
                num_circuits = all_circuits.len(),
                "Starting simulated GST run"
            );

            let gauge_opt = config.gauge_opt.clone();
            let mut results = IterativeGst::new(config).run(&dataset, &target, &lists)?;

            let mut distances = json!(null);
            if results.final_model().is_some() {
                let optimized = results.add_gauge_optimized("target", &target, &gauge_opt)?;
                distances = json!({
                    "frobenius": optimized.model.frobenius_distance(&truth, 1.0, 1.0)?,
                    "jtrace": optimized.model.jtrace_distance(&truth)?,
                });
            }

            let report = json!({
                "run": results.summary(),
                "distance_to_truth": distances,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);

            if !results.is_complete() {
                std::process::exit(2);
            }
        }

        Commands::Config => {
            // Show effective configuration
            println!("{}", serde_yaml::to_string(&config)?);
        }

        Commands::Validate => {
            // Validate configuration
            match config.validate() {
                Ok(()) => {
                    println!("Configuration is valid");
                }
                Err(e) => {
                    eprintln!("Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Initialize logging with tracing.
fn init_logging(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
