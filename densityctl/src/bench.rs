// Copyright (c) Facebook, Inc. and its affiliates.
//
// The benchmark orchestrator. Each instance count is one step:
//
//   snapshot(pre) -> spawn -> warmup -> snapshot(post) -> teardown -> record
//
// A step whose workloads can't be launched is recorded as aborted and the
// run moves on. Cancellation during warmup tears the step down and returns
// the steps recorded so far.
use anyhow::{anyhow, bail, Context, Result};
use chrono::Local;
use density_util::proc::HostInfo;
use density_util::*;
use densityctl_intf::{Args, DirtyParams, HogArgs, Profile, RunResult, StepResult};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use super::estimate::{estimate_saved_mib, ticks_delta};
use super::fleet::{Fleet, TeardownPolicy};
use super::progress::WarmupProgress;
use super::report;

const PROGRESS_INTV: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Binary re-invoked with the hog subcommand for each workload.
    pub exe: PathBuf,
    pub out_dir: PathBuf,
    pub ksm_path: String,
    pub profile: Profile,
    pub instances: Vec<usize>,
    pub mem_mib: usize,
    /// None for the default. An explicit zero is honored.
    pub warmup: Option<Duration>,
    pub redirty_intv: Option<Duration>,
    pub teardown: TeardownPolicy,
    pub publish: Option<PathBuf>,
}

impl RunConfig {
    pub const DFL_WARMUP: Duration = Duration::from_secs(20);

    pub fn new(exe: PathBuf, profile: Profile, instances: Vec<usize>) -> Self {
        let dfl = Args::default();
        Self {
            exe,
            out_dir: PathBuf::from(&dfl.out_dir),
            ksm_path: dfl.ksm_path,
            profile,
            instances,
            mem_mib: dfl.mem_mib,
            warmup: None,
            redirty_intv: None,
            teardown: Default::default(),
            publish: None,
        }
    }

    /// A non-positive `--warmup-sec` selects the default warmup.
    pub fn from_args(args: &Args, exe: PathBuf) -> Self {
        Self {
            out_dir: PathBuf::from(&args.out_dir),
            ksm_path: args.ksm_path.clone(),
            mem_mib: args.mem_mib,
            warmup: match args.warmup {
                v if v > 0.0 => Some(Duration::from_secs_f64(v)),
                _ => None,
            },
            redirty_intv: args.redirty_ms.map(Duration::from_millis),
            publish: args.publish.as_ref().map(PathBuf::from),
            ..Self::new(exe, args.profile, args.instances.clone())
        }
    }

    pub fn warmup(&self) -> Duration {
        self.warmup.unwrap_or(Self::DFL_WARMUP)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mem_mib == 0 {
            bail!("memory size must be > 0 MiB");
        }
        self.mem_mib
            .checked_mul(1 << 20)
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| anyhow!("memory size {}MiB is too large", self.mem_mib))?;

        if self.instances.is_empty() {
            bail!("no instance counts given");
        }
        let mut seen = BTreeSet::new();
        for &n in self.instances.iter() {
            if n == 0 {
                bail!("instance counts must be > 0");
            }
            if !seen.insert(n) {
                bail!("instance count {} is repeated", n);
            }
        }
        Ok(())
    }

    pub fn hog_args(&self, idx: usize, dirty: &DirtyParams) -> HogArgs {
        HogArgs {
            mem_mib: self.mem_mib as i64,
            id: idx as u64,
            dirty_pct: dirty.dirty_pct,
            redirty_ms: dirty
                .redirty_intv
                .map(|v| v.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    pub fn hog_command(&self, hog: &HogArgs) -> Command {
        let mut cmd = Command::new(&self.exe);
        cmd.args(hog.to_cmdline());
        cmd
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BenchError {
    #[error("invalid configuration ({0:#})")]
    Config(anyhow::Error),
    #[error("cancelled after {} completed steps", .partial.steps.len())]
    Cancelled { partial: RunResult },
    #[error("failed to save results ({source:#})")]
    Persist {
        result: RunResult,
        source: anyhow::Error,
    },
}

impl BenchError {
    /// Whatever was measured before the error, if anything.
    pub fn result(&self) -> Option<&RunResult> {
        match self {
            Self::Config(_) => None,
            Self::Cancelled { partial } => Some(partial),
            Self::Persist { result, .. } => Some(result),
        }
    }
}

/// System counters consumed by the orchestrator.
pub trait Probes {
    fn meminfo(&self) -> Result<BTreeMap<String, u64>>;
    fn vmstat(&self) -> Result<BTreeMap<String, u64>>;
    fn ksm_status(&self, ksm_path: &str) -> Result<BTreeMap<String, i64>>;
    fn ksmd_ticks(&self) -> Result<u64>;
    fn page_size(&self) -> usize;
    fn host_info(&self) -> HostInfo;
}

pub struct SysProbes;

impl Probes for SysProbes {
    fn meminfo(&self) -> Result<BTreeMap<String, u64>> {
        proc::read_meminfo()
    }

    fn vmstat(&self) -> Result<BTreeMap<String, u64>> {
        proc::read_vmstat()
    }

    fn ksm_status(&self, ksm_path: &str) -> Result<BTreeMap<String, i64>> {
        ksm::status(ksm_path)
    }

    fn ksmd_ticks(&self) -> Result<u64> {
        proc::read_ksmd_ticks()
    }

    fn page_size(&self) -> usize {
        *PAGE_SIZE
    }

    fn host_info(&self) -> HostInfo {
        HostInfo::probe()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SnapshotPre,
    Spawning,
    Warmup,
    SnapshotPost,
    TearingDown,
    Recorded,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::SnapshotPre => "snapshot(pre)",
            Self::Spawning => "spawning",
            Self::Warmup => "warmup",
            Self::SnapshotPost => "snapshot(post)",
            Self::TearingDown => "tearing down",
            Self::Recorded => "recorded",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

fn enter(n: usize, phase: Phase) {
    debug!("bench[{}]: {}", n, phase);
}

fn probe_opt<T>(what: &str, res: Result<T>) -> Option<T> {
    match res {
        Ok(v) => Some(v),
        Err(e) => {
            debug!("bench: {} unavailable ({:#})", what, &e);
            None
        }
    }
}

#[derive(Debug, Default)]
struct Snapshot {
    mem_kb: Option<BTreeMap<String, u64>>,
    ksm: Option<BTreeMap<String, i64>>,
    vmstat: Option<BTreeMap<String, u64>>,
    ksmd_ticks: Option<u64>,
}

impl Snapshot {
    fn take(probes: &dyn Probes, ksm_path: &str) -> Self {
        Self {
            mem_kb: probe_opt("meminfo", probes.meminfo()),
            ksm: probe_opt("ksm status", probes.ksm_status(ksm_path)),
            vmstat: probe_opt("vmstat", probes.vmstat()),
            ksmd_ticks: probe_opt("ksmd ticks", probes.ksmd_ticks()),
        }
    }
}

enum StepOutcome {
    Recorded(StepResult),
    Cancelled,
}

fn wait_warmup(fleet: &mut Fleet, n: usize, warmup: Duration, exit: &ProgExit) -> ProgState {
    let mut progress = WarmupProgress::new();
    let deadline = Instant::now() + warmup;

    loop {
        if exit.exiting() {
            return ProgState::Exiting;
        }
        let now = Instant::now();
        if now >= deadline {
            return ProgState::Running;
        }

        progress.set_status(&format!(
            "bench[{}]: warming up, {}/{} workloads alive, {} left",
            n,
            fleet.count_alive(),
            n,
            format_duration((deadline - now).as_secs_f64())
        ));
        exit.wait((deadline - now).min(PROGRESS_INTV));
    }
}

fn run_step<L>(
    cfg: &RunConfig,
    n: usize,
    dirty: &DirtyParams,
    exit: &ProgExit,
    probes: &dyn Probes,
    launch: &L,
) -> StepOutcome
where
    L: Fn(&HogArgs) -> Command,
{
    let warmup = cfg.warmup();
    let mut step = StepResult::new(n, cfg.profile, cfg.mem_mib, warmup.as_secs_f64());

    enter(n, Phase::SnapshotPre);
    let pre = Snapshot::take(probes, &cfg.ksm_path);
    step.pre_mem_kb = pre.mem_kb;
    step.pre_ksm = pre.ksm;
    step.pre_vmstat = pre.vmstat;

    enter(n, Phase::Spawning);
    let started_at = Instant::now();
    let mut fleet = match Fleet::spawn(n, cfg.teardown, |idx| launch(&cfg.hog_args(idx, dirty))) {
        Ok(v) => v,
        Err(e) => {
            enter(n, Phase::Aborted);
            warn!("bench[{}]: step aborted ({})", n, &e);
            step.aborted = true;
            step.add_note(&format!("launch failed at workload {}: {}", e.idx, &e.source));
            return StepOutcome::Recorded(step);
        }
    };

    enter(n, Phase::Warmup);
    if wait_warmup(&mut fleet, n, warmup, exit) == ProgState::Exiting {
        enter(n, Phase::TearingDown);
        fleet.teardown();
        return StepOutcome::Cancelled;
    }

    enter(n, Phase::SnapshotPost);
    step.alive = fleet.count_alive();
    let post = Snapshot::take(probes, &cfg.ksm_path);
    step.duration = started_at.elapsed().as_secs_f64();

    step.estimated_saved_mib = estimate_saved_mib(post.ksm.as_ref(), probes.page_size());
    step.ksmd_ticks_delta = ticks_delta(pre.ksmd_ticks, post.ksmd_ticks);
    if post.ksm.is_none() {
        step.add_note("KSM status unavailable");
    }
    if step.alive < n {
        step.add_note(&format!("only {}/{} workloads alive", step.alive, n));
    }
    step.post_mem_kb = post.mem_kb;
    step.post_ksm = post.ksm;
    step.post_vmstat = post.vmstat;

    enter(n, Phase::TearingDown);
    fleet.teardown();

    enter(n, Phase::Recorded);
    StepOutcome::Recorded(step)
}

/// Run the benchmark with workloads launched by `launch`.
pub fn run_with<L>(
    cfg: &RunConfig,
    exit: &ProgExit,
    probes: &dyn Probes,
    launch: L,
) -> Result<RunResult, BenchError>
where
    L: Fn(&HogArgs) -> Command,
{
    cfg.validate().map_err(BenchError::Config)?;
    fs::create_dir_all(&cfg.out_dir)
        .with_context(|| format!("creating output directory {:?}", &cfg.out_dir))
        .map_err(BenchError::Config)?;

    let dirty = cfg.profile.dirty_params(cfg.redirty_intv);
    let mut res = RunResult {
        started_at: Local::now(),
        profile: cfg.profile,
        host: probes.host_info(),
        mem_mib: cfg.mem_mib,
        warmup: cfg.warmup().as_secs_f64(),
        instances: cfg.instances.clone(),
        steps: vec![],
    };

    info!(
        "bench: profile={} instances={:?} mem={}MiB warmup={} dirty={}% redirty={}",
        cfg.profile,
        &cfg.instances,
        cfg.mem_mib,
        format_duration(cfg.warmup().as_secs_f64()),
        dirty.dirty_pct,
        dirty
            .redirty_intv
            .map(|v| format_duration(v.as_secs_f64()))
            .unwrap_or("-".into())
    );

    for &n in cfg.instances.iter() {
        if exit.exiting() {
            return Err(BenchError::Cancelled { partial: res });
        }
        match run_step(cfg, n, &dirty, exit, probes, &launch) {
            StepOutcome::Recorded(step) => {
                info!(
                    "bench[{}]: alive={} saved={:.1}MiB ksmd_ticks={} avail={:.1}->{:.1}MiB{}",
                    n,
                    step.alive,
                    step.estimated_saved_mib,
                    step.ksmd_ticks_delta
                        .map(|v| v.to_string())
                        .unwrap_or("-".into()),
                    step.pre_mem_avail_mib(),
                    step.post_mem_avail_mib(),
                    if step.aborted { " (aborted)" } else { "" }
                );
                res.steps.push(step);
            }
            StepOutcome::Cancelled => {
                warn!("bench[{}]: cancelled", n);
                return Err(BenchError::Cancelled { partial: res });
            }
        }
    }

    match report::persist(&res, &cfg.out_dir, cfg.publish.as_deref()) {
        Ok(path) => info!("bench: results saved to {:?}", &path),
        Err(e) => return Err(BenchError::Persist { result: res, source: e }),
    }
    Ok(res)
}

/// Run the benchmark re-invoking `cfg.exe` for each workload.
pub fn run(cfg: &RunConfig, exit: &ProgExit, probes: &dyn Probes) -> Result<RunResult, BenchError> {
    run_with(cfg, exit, probes, |hog| cfg.hog_command(hog))
}
