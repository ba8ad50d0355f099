// Copyright (c) Facebook, Inc. and its affiliates.
//
// Kernel samepage merging controls and statistics under sysfs.
use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use super::{read_one_line, write_one_line, ProgExit, ProgState};

pub const DFL_PATH: &str = "/sys/kernel/mm/ksm";

pub const PAGES_SHARED: &str = "pages_shared";
pub const PAGES_SHARING: &str = "pages_sharing";

const UNMERGE_POLL_INTV: Duration = Duration::from_millis(500);

/// The value written to `run`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KsmRun {
    Stop = 0,
    Merge = 1,
    Unmerge = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KsmKnobs {
    pub path: String,
    pub pages_to_scan: u32,
    pub sleep_millisecs: u32,
    /// None leaves the current setting alone.
    pub merge_across_nodes: Option<u32>,
}

impl Default for KsmKnobs {
    fn default() -> Self {
        Self {
            path: DFL_PATH.into(),
            pages_to_scan: 100,
            sleep_millisecs: 20,
            merge_across_nodes: None,
        }
    }
}

fn knob_path(dir: &str, name: &str) -> PathBuf {
    Path::new(dir).join(name)
}

pub fn read_knob(dir: &str, name: &str) -> Result<i64> {
    let path = knob_path(dir, name);
    let line = read_one_line(&path).with_context(|| format!("reading {:?}", &path))?;
    Ok(line
        .trim()
        .parse::<i64>()
        .with_context(|| format!("parsing {:?}", &path))?)
}

pub fn write_knob(dir: &str, name: &str, val: i64) -> Result<()> {
    let path = knob_path(dir, name);
    debug!("ksm: writing {} to {:?}", val, &path);
    write_one_line(&path, &format!("{}", val)).with_context(|| format!("writing {:?}", &path))
}

fn set_run(dir: &str, run: KsmRun) -> Result<()> {
    write_knob(dir, "run", run as i64)
}

/// Read all numeric files in the KSM directory. Directories and
/// non-numeric files are ignored.
pub fn status(dir: &str) -> Result<BTreeMap<String, i64>> {
    let entries = fs::read_dir(dir).with_context(|| format!("reading KSM directory {:?}", dir))?;

    let mut out = BTreeMap::new();
    for entry in entries.filter_map(|x| x.ok()) {
        match entry.file_type() {
            Ok(ft) if ft.is_file() => {}
            _ => continue,
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if let Ok(v) = read_knob(dir, &name) {
            out.insert(name, v);
        }
    }

    if out.is_empty() {
        bail!(
            "no numeric KSM fields found in {:?}, does the kernel support KSM?",
            dir
        );
    }
    Ok(out)
}

/// Apply the tuning knobs and then start merging.
pub fn enable(knobs: &KsmKnobs) -> Result<()> {
    if knobs.pages_to_scan == 0 {
        bail!("pages_to_scan must be > 0");
    }

    let dir = &knobs.path;
    write_knob(dir, "pages_to_scan", knobs.pages_to_scan as i64)?;
    write_knob(dir, "sleep_millisecs", knobs.sleep_millisecs as i64)?;
    if let Some(v) = knobs.merge_across_nodes {
        write_knob(dir, "merge_across_nodes", v as i64)?;
    }
    set_run(dir, KsmRun::Merge)?;

    info!(
        "ksm: enabled (pages_to_scan={} sleep_millisecs={} merge_across_nodes={})",
        knobs.pages_to_scan,
        knobs.sleep_millisecs,
        knobs
            .merge_across_nodes
            .map(|v| v.to_string())
            .unwrap_or("-".into())
    );
    Ok(())
}

/// Stop KSM. With `unmerge`, all merged pages are broken up first and
/// `pages_shared` is polled until it drops to zero or `timeout` expires.
/// The wait is best-effort and cut short by `exit`.
pub fn disable(dir: &str, unmerge: bool, timeout: Duration, exit: &ProgExit) -> Result<()> {
    if unmerge {
        set_run(dir, KsmRun::Unmerge)?;

        let deadline = Instant::now() + timeout;
        loop {
            match read_knob(dir, PAGES_SHARED) {
                Ok(0) => break,
                Ok(v) => debug!("ksm: waiting for unmerge, {}={}", PAGES_SHARED, v),
                Err(e) => debug!("ksm: failed to read {} ({:#})", PAGES_SHARED, &e),
            }
            if Instant::now() >= deadline {
                warn!(
                    "ksm: {} didn't reach 0 in {}s, stopping anyway",
                    PAGES_SHARED,
                    timeout.as_secs()
                );
                break;
            }
            if exit.wait(UNMERGE_POLL_INTV) == ProgState::Exiting {
                break;
            }
        }
    }

    set_run(dir, KsmRun::Stop)?;
    info!("ksm: disabled");
    Ok(())
}
