// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Context, Result};
use density_util::*;
use serde::{Deserialize, Serialize};
use std::process::exit;
use std::str::FromStr;

use super::{Profile, HOG_SUBCMD};

const HELP_BODY: &str = "\
DENSITY - more instances per host by reducing memory pressure with KSM.

densityctl manages kernel samepage merging (KSM) through sysfs and measures
its effect with reproducible benchmarks. The bench subcommand spawns the
requested number of synthetic workloads per step, waits for the scanner to
do its work and records memory savings and ksmd CPU cost.

Profiles:
  P1  identical workloads, best case for merging
  P2  similar workloads, 5% unique pages
  P3  divergent workloads, 50% unique pages rewritten every second

Only standard kernel interfaces are used, no kernel modules. All changes
can be reverted with the disable subcommand.
";

lazy_static::lazy_static! {
    static ref ENABLE_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "    --ksm-path=[PATH]          'KSM sysfs directory (dfl: {dfl_ksm})'
                 --pages-to-scan=[NR]       'Pages to scan per wakeup (dfl: {dfl_scan})'
                 --sleep-ms=[MSECS]         'Sleep between scans (dfl: {dfl_sleep})'
                 --merge-across-nodes=[BOOL] 'Allow merging across NUMA nodes, 0 or 1 (dfl: unchanged)'
                 --dry-run                  'Only show what would be done'",
            dfl_ksm = dfl.ksm_path,
            dfl_scan = dfl.pages_to_scan,
            dfl_sleep = dfl.sleep_ms,
        )
    };
    static ref DISABLE_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "    --ksm-path=[PATH]          'KSM sysfs directory (dfl: {dfl_ksm})'
                 --no-unmerge               'Stop scanning but leave merged pages alone'
                 --timeout-sec=[DUR]        'How long to wait for unmerging (dfl: {dfl_timeout})'
                 --dry-run                  'Only show what would be done'",
            dfl_ksm = dfl.ksm_path,
            dfl_timeout = format_duration(dfl.unmerge_timeout),
        )
    };
    static ref STATUS_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "    --ksm-path=[PATH]          'KSM sysfs directory (dfl: {dfl_ksm})'
                 --json                     'Output in json'",
            dfl_ksm = dfl.ksm_path,
        )
    };
    static ref BENCH_ARGS_STR: String = {
        let dfl = Args::default();
        format!(
            "-p, --profile=[PROFILE]        'P1 (identical), P2 (similar) or P3 (divergent) (dfl: {dfl_profile})'
             -s, --scale=[RANGE]            'Instance counts as MIN..MAX or MIN..MAX..STEP'
             -n, --instances=[NR]           'Fixed number of instances instead of --scale'
             -m, --mem-mib=[MIB]            'Memory per instance in MiB (dfl: {dfl_mem})'
             -w, --warmup-sec=[DUR]         'Time given to KSM before measuring (dfl: {dfl_warmup})'
                 --redirty-ms=[MSECS]       'Re-dirty interval for P3 (dfl: {dfl_redirty})'
             -o, --out=[DIR]                'Output directory (dfl: {dfl_out})'
                 --publish=[PATH]           'Additionally write the json result to PATH'
                 --ksm-path=[PATH]          'KSM sysfs directory (dfl: {dfl_ksm})'",
            dfl_profile = dfl.profile,
            dfl_mem = dfl.mem_mib,
            dfl_warmup = format_duration(dfl.warmup),
            dfl_redirty = Profile::DFL_REDIRTY_INTV.as_millis(),
            dfl_out = dfl.out_dir,
            dfl_ksm = dfl.ksm_path,
        )
    };
}

const HOG_ARGS_STR: &str = "\
    --mem-mib=[MIB]     'Allocation size in MiB'
    --id=[ID]           'Instance ID'
    --dirty-pct=[PCT]   'Percentage of pages made unique to this instance (0..100)'
    --redirty-ms=[MSECS] 'Rewrite the unique pages every MSECS, 0 disables'";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Mode {
    Enable,
    Disable,
    Status,
    Bench,
    Hog,
}

/// Workload parameters. Kept signed and unvalidated here so that the
/// workload itself can reject them before allocating anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HogArgs {
    pub mem_mib: i64,
    pub id: u64,
    pub dirty_pct: f64,
    pub redirty_ms: u64,
}

impl Default for HogArgs {
    fn default() -> Self {
        Self {
            mem_mib: 256,
            id: 0,
            dirty_pct: 0.0,
            redirty_ms: 0,
        }
    }
}

impl HogArgs {
    pub fn to_cmdline(&self) -> Vec<String> {
        vec![
            HOG_SUBCMD.into(),
            "--mem-mib".into(),
            format!("{}", self.mem_mib),
            "--id".into(),
            format!("{}", self.id),
            "--dirty-pct".into(),
            format!("{:.2}", self.dirty_pct),
            "--redirty-ms".into(),
            format!("{}", self.redirty_ms),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Args {
    pub ksm_path: String,

    pub pages_to_scan: u32,
    pub sleep_ms: u32,
    pub merge_across_nodes: Option<u32>,
    pub unmerge_timeout: f64,

    pub profile: Profile,
    pub mem_mib: usize,
    pub warmup: f64,
    pub redirty_ms: Option<u64>,
    pub out_dir: String,
    pub publish: Option<String>,

    #[serde(skip)]
    pub mode: Option<Mode>,
    #[serde(skip)]
    pub instances: Vec<usize>,
    #[serde(skip)]
    pub unmerge: bool,
    #[serde(skip)]
    pub dry_run: bool,
    #[serde(skip)]
    pub json: bool,
    #[serde(skip)]
    pub hog: HogArgs,
    #[serde(skip)]
    pub verbosity: u32,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            ksm_path: ksm::DFL_PATH.into(),
            pages_to_scan: 100,
            sleep_ms: 20,
            merge_across_nodes: None,
            unmerge_timeout: 60.0,
            profile: Profile::Identical,
            mem_mib: 256,
            warmup: 20.0,
            redirty_ms: None,
            out_dir: "results".into(),
            publish: None,
            mode: None,
            instances: vec![],
            unmerge: true,
            dry_run: false,
            json: false,
            hog: Default::default(),
            verbosity: 0,
        }
    }
}

/// Parse "MIN..MAX" or "MIN..MAX..STEP" into the list of instance counts.
pub fn parse_scale(input: &str) -> Result<Vec<usize>> {
    let parts: Vec<&str> = input.split("..").collect();
    if parts.len() != 2 && parts.len() != 3 {
        bail!(
            "invalid scale {:?}, expected MIN..MAX or MIN..MAX..STEP",
            input
        );
    }

    let parse = |s: &str| -> Result<i64> {
        s.trim()
            .parse::<i64>()
            .with_context(|| format!("invalid number {:?} in scale {:?}", s, input))
    };

    let min = parse(parts[0])?;
    let max = parse(parts[1])?;
    let step = match parts.get(2) {
        Some(s) => parse(s)?,
        None => 1,
    };

    if step <= 0 {
        bail!("scale step must be > 0 ({:?})", input);
    }
    if min <= 0 || max <= 0 || max < min {
        bail!("invalid scale bounds {}..{}", min, max);
    }

    Ok((min..=max).step_by(step as usize).map(|x| x as usize).collect())
}

fn parse_opt<T>(matches: &clap::ArgMatches, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    <T as FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match matches.value_of(name) {
        Some(v) => Ok(Some(
            v.trim()
                .parse::<T>()
                .with_context(|| format!("invalid --{} {:?}", name, v))?,
        )),
        None => Ok(None),
    }
}

fn parse_opt_dur(matches: &clap::ArgMatches, name: &str) -> Result<Option<f64>> {
    match matches.value_of(name) {
        Some(v) => Ok(Some(
            parse_duration(v).with_context(|| format!("invalid --{} {:?}", name, v))?,
        )),
        None => Ok(None),
    }
}

impl Args {
    fn process_ksm_path(&mut self, subm: &clap::ArgMatches) -> bool {
        if let Some(v) = subm.value_of("ksm-path") {
            self.ksm_path = if v.len() > 0 {
                v.to_string()
            } else {
                Args::default().ksm_path
            };
            return true;
        }
        false
    }

    fn process_enable(&mut self, subm: &clap::ArgMatches) -> Result<bool> {
        let mut updated = self.process_ksm_path(subm);

        if let Some(v) = parse_opt::<u32>(subm, "pages-to-scan")? {
            if v == 0 {
                bail!("--pages-to-scan must be > 0");
            }
            self.pages_to_scan = v;
            updated = true;
        }
        if let Some(v) = parse_opt::<u32>(subm, "sleep-ms")? {
            self.sleep_ms = v;
            updated = true;
        }
        if let Some(v) = parse_opt::<u32>(subm, "merge-across-nodes")? {
            if v > 1 {
                bail!("--merge-across-nodes must be 0 or 1");
            }
            self.merge_across_nodes = Some(v);
            updated = true;
        }
        self.dry_run = subm.is_present("dry-run");
        Ok(updated)
    }

    fn process_disable(&mut self, subm: &clap::ArgMatches) -> Result<bool> {
        let mut updated = self.process_ksm_path(subm);

        if let Some(v) = parse_opt_dur(subm, "timeout-sec")? {
            self.unmerge_timeout = v;
            updated = true;
        }
        self.unmerge = !subm.is_present("no-unmerge");
        self.dry_run = subm.is_present("dry-run");
        Ok(updated)
    }

    fn process_status(&mut self, subm: &clap::ArgMatches) -> Result<bool> {
        let updated = self.process_ksm_path(subm);
        self.json = subm.is_present("json");
        Ok(updated)
    }

    fn process_bench(&mut self, subm: &clap::ArgMatches) -> Result<bool> {
        let mut updated = self.process_ksm_path(subm);

        if let Some(v) = subm.value_of("profile") {
            self.profile = v.parse::<Profile>()?;
            updated = true;
        }
        if let Some(v) = parse_opt::<usize>(subm, "mem-mib")? {
            if v == 0 {
                bail!("--mem-mib must be > 0");
            }
            self.mem_mib = v;
            updated = true;
        }
        if let Some(v) = parse_opt_dur(subm, "warmup-sec")? {
            self.warmup = v;
            updated = true;
        }
        if let Some(v) = parse_opt::<u64>(subm, "redirty-ms")? {
            self.redirty_ms = if v > 0 { Some(v) } else { None };
            updated = true;
        }
        if let Some(v) = subm.value_of("out") {
            self.out_dir = if v.len() > 0 {
                v.to_string()
            } else {
                Args::default().out_dir
            };
            updated = true;
        }
        if let Some(v) = subm.value_of("publish") {
            self.publish = if v.len() > 0 { Some(v.to_string()) } else { None };
            updated = true;
        }

        self.instances = match (subm.value_of("scale"), parse_opt::<usize>(subm, "instances")?) {
            (Some(scale), _) => parse_scale(scale)?,
            (None, Some(nr)) if nr > 0 => vec![nr],
            _ => bail!("bench requires --scale or --instances"),
        };

        Ok(updated)
    }

    fn process_hog(&mut self, subm: &clap::ArgMatches) -> Result<()> {
        let dfl = HogArgs::default();
        self.hog = HogArgs {
            mem_mib: parse_opt::<i64>(subm, "mem-mib")?.unwrap_or(dfl.mem_mib),
            id: parse_opt::<u64>(subm, "id")?.unwrap_or(dfl.id),
            dirty_pct: parse_opt::<f64>(subm, "dirty-pct")?.unwrap_or(dfl.dirty_pct),
            redirty_ms: parse_opt::<u64>(subm, "redirty-ms")?.unwrap_or(dfl.redirty_ms),
        };
        Ok(())
    }
}

impl JsonLoad for Args {}
impl JsonSave for Args {}

impl JsonArgs for Args {
    fn match_cmdline() -> clap::ArgMatches<'static> {
        let app = clap::App::new("densityctl")
            .version(env!("CARGO_PKG_VERSION"))
            .author(env!("CARGO_PKG_AUTHORS"))
            .about(HELP_BODY)
            .setting(clap::AppSettings::UnifiedHelpMessage)
            .setting(clap::AppSettings::DeriveDisplayOrder)
            .setting(clap::AppSettings::SubcommandRequiredElseHelp)
            .args_from_usage(
                "-a, --args=[FILE] 'Load base command line arguments from FILE'
                 -v...             'Sets the level of verbosity'",
            )
            .subcommand(
                clap::SubCommand::with_name("enable")
                    .about("Enable KSM with conservative tuning")
                    .args_from_usage(&ENABLE_ARGS_STR),
            )
            .subcommand(
                clap::SubCommand::with_name("disable")
                    .about("Disable KSM, unmerging pages by default")
                    .args_from_usage(&DISABLE_ARGS_STR),
            )
            .subcommand(
                clap::SubCommand::with_name("status")
                    .about("Show KSM counters")
                    .args_from_usage(&STATUS_ARGS_STR),
            )
            .subcommand(
                clap::SubCommand::with_name("bench")
                    .about("Run the density benchmark")
                    .args_from_usage(&BENCH_ARGS_STR),
            )
            .subcommand(
                clap::SubCommand::with_name(HOG_SUBCMD)
                    .setting(clap::AppSettings::Hidden)
                    .setting(clap::AppSettings::AllowNegativeNumbers)
                    .args_from_usage(HOG_ARGS_STR),
            );

        match app.get_matches_safe() {
            Ok(v) => v,
            Err(e) => match e.kind {
                clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => e.exit(),
                _ => {
                    eprintln!("{}", e.message);
                    exit(2);
                }
            },
        }
    }

    fn verbosity(matches: &clap::ArgMatches) -> u32 {
        matches.occurrences_of("v") as u32
    }

    fn process_cmdline(&mut self, matches: &clap::ArgMatches) -> Result<bool> {
        self.verbosity = Self::verbosity(matches);

        let updated = match matches.subcommand() {
            ("enable", Some(subm)) => {
                self.mode = Some(Mode::Enable);
                self.process_enable(subm)?
            }
            ("disable", Some(subm)) => {
                self.mode = Some(Mode::Disable);
                self.process_disable(subm)?
            }
            ("status", Some(subm)) => {
                self.mode = Some(Mode::Status);
                self.process_status(subm)?
            }
            ("bench", Some(subm)) => {
                self.mode = Some(Mode::Bench);
                self.process_bench(subm)?
            }
            (HOG_SUBCMD, Some(subm)) => {
                self.mode = Some(Mode::Hog);
                self.process_hog(subm)?;
                false
            }
            (cmd, _) => bail!("unknown command {:?}", cmd),
        };

        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scale() {
        assert_eq!(
            parse_scale("10..80..10").unwrap(),
            vec![10, 20, 30, 40, 50, 60, 70, 80]
        );
        assert_eq!(parse_scale("1..4").unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(parse_scale(" 3 .. 3 ").unwrap(), vec![3]);
        assert_eq!(parse_scale("1..10..4").unwrap(), vec![1, 5, 9]);

        for bad in &["5..3", "0..10", "10..80..0", "10..80..-1", "10", "1..2..3..4", "a..3"] {
            assert!(parse_scale(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_hog_cmdline() {
        let hog = HogArgs {
            mem_mib: 64,
            id: 3,
            dirty_pct: 5.0,
            redirty_ms: 0,
        };
        assert_eq!(
            hog.to_cmdline(),
            vec![
                "__hog",
                "--mem-mib",
                "64",
                "--id",
                "3",
                "--dirty-pct",
                "5.00",
                "--redirty-ms",
                "0"
            ]
        );
    }

    #[test]
    fn test_args_defaults_roundtrip() {
        let args: Args = serde_json::from_str("{\"mem_mib\": 64}").unwrap();
        assert_eq!(args.mem_mib, 64);
        assert_eq!(args.ksm_path, ksm::DFL_PATH);
        assert_eq!(args.profile, Profile::Identical);
        assert!(args.unmerge);
        assert!(args.mode.is_none());
    }
}
