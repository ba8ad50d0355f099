// Copyright (c) Facebook, Inc. and its affiliates.
//
// The synthetic workload. densityctl re-invokes itself through the hidden
// hog subcommand to run one of these per spawned process.
use anyhow::{anyhow, bail, Result};
use densityctl_intf::HogArgs;
use log::{debug, info, trace, warn};
use std::convert::TryFrom;
use std::time::Duration;

use density_util::*;

use super::pattern::{apply_dirty, dirty_indices, fill_template};

#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    pub id: u64,
    pub size: usize,
    pub dirty_pct: f64,
    /// None if the dirty pages are written only once.
    pub redirty_intv: Option<Duration>,
}

impl Workload {
    /// Validate `args` without allocating anything.
    pub fn from_args(args: &HogArgs) -> Result<Self> {
        if args.mem_mib <= 0 {
            bail!("memory size must be > 0 MiB, got {}", args.mem_mib);
        }
        if !(args.dirty_pct >= 0.0 && args.dirty_pct <= 100.0) {
            bail!("dirty percentage must be in [0, 100], got {}", args.dirty_pct);
        }

        let size = usize::try_from(args.mem_mib)
            .ok()
            .and_then(|mib| mib.checked_mul(1 << 20))
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| anyhow!("memory size {}MiB is too large", args.mem_mib))?;

        Ok(Self {
            id: args.id,
            size,
            dirty_pct: args.dirty_pct,
            redirty_intv: match args.redirty_ms {
                0 => None,
                v => Some(Duration::from_millis(v)),
            },
        })
    }

    /// Populate the area and keep it resident until `exit` is set. Doesn't
    /// return otherwise.
    pub fn run(&self, exit: &ProgExit) -> Result<()> {
        let mut area = PageArea::new(self.size)?;
        fill_template(area.as_mut_slice());

        let idxs = dirty_indices(self.id, area.nr_pages(), self.dirty_pct);
        apply_dirty(&mut area, &idxs, self.id, 0);

        if let Err(e) = area.madvise_mergeable() {
            warn!("hog[{}]: {:#}", self.id, &e);
        }

        debug!(
            "hog[{}]: size={} pages={} dirty={} redirty={}",
            self.id,
            format_size(area.size()),
            area.nr_pages(),
            idxs.len(),
            self.redirty_intv
                .map(|v| format_duration(v.as_secs_f64()))
                .unwrap_or("-".into())
        );

        match self.redirty_intv {
            Some(intv) if !idxs.is_empty() => {
                let mut counter: u64 = 0;
                while exit.wait(intv) == ProgState::Running {
                    counter += 1;
                    trace!("hog[{}]: redirtying {} pages ({})", self.id, idxs.len(), counter);
                    apply_dirty(&mut area, &idxs, self.id, counter);
                }
            }
            _ => exit.wait_exit(),
        }

        info!("hog[{}]: exiting", self.id);
        Ok(())
    }
}
