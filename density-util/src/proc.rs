// Copyright (c) Facebook, Inc. and its affiliates.
//
// System memory and scanner CPU accounting from procfs.
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{read_flat_keyed_file, NR_SYSTEM_CPUS, PAGE_SIZE, TOTAL_SYSTEM_MEMORY, TOTAL_SYSTEM_SWAP};

pub const MEMINFO_PATH: &str = "/proc/meminfo";
pub const VMSTAT_PATH: &str = "/proc/vmstat";

pub const MEMINFO_KEYS: [&str; 5] = ["MemTotal", "MemFree", "MemAvailable", "SwapTotal", "SwapFree"];
pub const VMSTAT_KEYS: [&str; 2] = ["pswpin", "pswpout"];

pub const KSMD_COMM: &str = "ksmd";

/// Selected /proc/meminfo fields in kB.
pub fn read_meminfo() -> Result<BTreeMap<String, u64>> {
    read_flat_keyed_file(MEMINFO_PATH, &MEMINFO_KEYS)
}

/// Swap in/out page counters from /proc/vmstat.
pub fn read_vmstat() -> Result<BTreeMap<String, u64>> {
    read_flat_keyed_file(VMSTAT_PATH, &VMSTAT_KEYS)
}

/// Find the first process whose comm matches `comm`.
pub fn find_pid_by_comm(comm: &str) -> Result<i32> {
    for proc in procfs::process::all_processes()? {
        let proc = match proc {
            Ok(v) => v,
            Err(_) => continue,
        };
        match proc.stat() {
            Ok(stat) if stat.comm == comm => return Ok(stat.pid),
            _ => {}
        }
    }
    Err(anyhow!("process {:?} not found", comm))
}

/// utime + stime of the process with the given comm, in clock ticks.
pub fn read_comm_ticks(comm: &str) -> Result<u64> {
    let pid = find_pid_by_comm(comm)?;
    let stat = procfs::process::Process::new(pid)?.stat()?;
    Ok(stat.utime + stat.stime)
}

/// CPU time consumed by the KSM scanner thread so far.
pub fn read_ksmd_ticks() -> Result<u64> {
    read_comm_ticks(KSMD_COMM)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub nr_cpus: usize,
    pub total_memory: usize,
    pub total_swap: usize,
    pub page_size: usize,
}

impl HostInfo {
    pub fn probe() -> Self {
        Self {
            nr_cpus: *NR_SYSTEM_CPUS,
            total_memory: *TOTAL_SYSTEM_MEMORY,
            total_swap: *TOTAL_SYSTEM_SWAP,
            page_size: *PAGE_SIZE,
        }
    }
}
