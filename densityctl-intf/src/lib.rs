// Copyright (c) Facebook, Inc. and its affiliates.
pub mod args;
pub mod profile;
pub mod report;

pub use args::{parse_scale, Args, HogArgs, Mode};
pub use profile::{DirtyParams, Profile};
pub use report::{RunResult, StepResult};

/// Name of the hidden subcommand used to re-invoke densityctl as a workload.
pub const HOG_SUBCMD: &str = "__hog";
