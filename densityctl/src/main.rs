// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use density_util::*;
use densityctl_intf::{Args, Mode};
use log::{error, info, warn};
use std::process::exit;

mod bench;
mod ctl;
mod estimate;
mod fleet;
mod pattern;
mod progress;
mod report;
mod workload;

use bench::{BenchError, RunConfig, SysProbes};
use workload::Workload;

fn run_hog(args: &Args, exit: &ProgExit) -> Result<()> {
    Workload::from_args(&args.hog)?.run(exit)
}

fn run_bench(args: &Args, exit: &ProgExit) -> Result<()> {
    let exe = std::env::current_exe().context("locating densityctl binary")?;
    let cfg = RunConfig::from_args(args, exe);

    match bench::run(&cfg, exit, &SysProbes) {
        Ok(res) => {
            info!("bench: {} steps completed", res.steps.len());
            Ok(())
        }
        Err(BenchError::Cancelled { partial }) => {
            if !partial.steps.is_empty() {
                match report::persist(&partial, &cfg.out_dir, None) {
                    Ok(path) => info!(
                        "bench: {} completed steps saved to {:?}",
                        partial.steps.len(),
                        &path
                    ),
                    Err(e) => warn!("bench: failed to save completed steps ({:#})", &e),
                }
            }
            Err(BenchError::Cancelled { partial }.into())
        }
        Err(e) => {
            if let Some(res) = e.result() {
                warn!("bench: {} measured steps weren't saved", res.steps.len());
            }
            Err(e.into())
        }
    }
}

fn main() {
    let args_file = match Args::init_args_and_logging() {
        Ok(v) => v,
        Err(e) => {
            error!("cfg: {:#}", &e);
            exit(1);
        }
    };
    let args = &args_file.data;

    let prog_exit = match setup_prog_state() {
        Ok(v) => v,
        Err(e) => {
            error!("{:#}", &e);
            exit(1);
        }
    };

    let res = match args.mode {
        Some(Mode::Enable) => ctl::enable(args),
        Some(Mode::Disable) => ctl::disable(args, &prog_exit),
        Some(Mode::Status) => ctl::status(args),
        Some(Mode::Bench) => run_bench(args, &prog_exit),
        Some(Mode::Hog) => run_hog(args, &prog_exit),
        None => Err(anyhow::anyhow!("no command given")),
    };

    if let Err(e) = res {
        error!("{:#}", &e);
        exit(1);
    }
}
