// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::{DateTime, Local};
use density_util::proc::HostInfo;
use density_util::{JsonLoad, JsonSave};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::Profile;

/// One measurement for one instance count.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepResult {
    pub n: usize,
    pub alive: usize,
    /// Seconds from spawn to the post-warmup sample.
    pub duration: f64,
    pub profile: Profile,
    pub mem_mib: usize,
    pub warmup: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_mem_kb: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_mem_kb: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_ksm: Option<BTreeMap<String, i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_ksm: Option<BTreeMap<String, i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_vmstat: Option<BTreeMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_vmstat: Option<BTreeMap<String, u64>>,

    pub estimated_saved_mib: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ksmd_ticks_delta: Option<u64>,

    /// Set when the workloads couldn't be launched.
    pub aborted: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

impl StepResult {
    pub const MEM_AVAIL_KEY: &'static str = "MemAvailable";

    pub fn new(n: usize, profile: Profile, mem_mib: usize, warmup: f64) -> Self {
        Self {
            n,
            profile,
            mem_mib,
            warmup,
            ..Default::default()
        }
    }

    pub fn add_note(&mut self, note: &str) {
        if !self.notes.is_empty() {
            self.notes += "; ";
        }
        self.notes += note;
    }

    fn mem_avail_mib(mem_kb: &Option<BTreeMap<String, u64>>) -> f64 {
        mem_kb
            .as_ref()
            .and_then(|m| m.get(Self::MEM_AVAIL_KEY))
            .map(|kb| *kb as f64 / 1024.0)
            .unwrap_or(0.0)
    }

    pub fn pre_mem_avail_mib(&self) -> f64 {
        Self::mem_avail_mib(&self.pre_mem_kb)
    }

    pub fn post_mem_avail_mib(&self) -> f64 {
        Self::mem_avail_mib(&self.post_mem_kb)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub started_at: DateTime<Local>,
    pub profile: Profile,
    #[serde(default)]
    pub host: HostInfo,
    #[serde(default)]
    pub mem_mib: usize,
    #[serde(default)]
    pub warmup: f64,
    #[serde(default)]
    pub instances: Vec<usize>,
    pub steps: Vec<StepResult>,
}

impl Default for RunResult {
    fn default() -> Self {
        Self {
            started_at: Local::now(),
            profile: Default::default(),
            host: Default::default(),
            mem_mib: 0,
            warmup: 0.0,
            instances: vec![],
            steps: vec![],
        }
    }
}

impl JsonLoad for RunResult {}
impl JsonSave for RunResult {}
