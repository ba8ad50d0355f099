// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How much the workload instances diverge from each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    /// All pages identical across instances, best case for merging.
    #[serde(rename = "P1")]
    Identical,
    /// A small share of pages unique per instance.
    #[serde(rename = "P2")]
    Similar,
    /// Half of the pages unique and rewritten periodically.
    #[serde(rename = "P3")]
    Divergent,
}

/// Per-workload page dirtying parameters derived from a profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirtyParams {
    pub dirty_pct: f64,
    /// None disables re-dirtying.
    pub redirty_intv: Option<Duration>,
}

impl Profile {
    pub const DFL_REDIRTY_INTV: Duration = Duration::from_secs(1);

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Identical => "P1",
            Self::Similar => "P2",
            Self::Divergent => "P3",
        }
    }

    /// Only the divergent profile re-dirties, so `redirty_ovr` is ignored
    /// for the others.
    pub fn dirty_params(&self, redirty_ovr: Option<Duration>) -> DirtyParams {
        match self {
            Self::Identical => DirtyParams {
                dirty_pct: 0.0,
                redirty_intv: None,
            },
            Self::Similar => DirtyParams {
                dirty_pct: 5.0,
                redirty_intv: None,
            },
            Self::Divergent => DirtyParams {
                dirty_pct: 50.0,
                redirty_intv: Some(match redirty_ovr {
                    Some(v) if v > Duration::from_secs(0) => v,
                    _ => Self::DFL_REDIRTY_INTV,
                }),
            },
        }
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::Identical
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

impl FromStr for Profile {
    type Err = anyhow::Error;

    fn from_str(input: &str) -> Result<Self> {
        Ok(match input.trim().to_lowercase().as_str() {
            "p1" | "identical" => Self::Identical,
            "p2" | "similar" => Self::Similar,
            "p3" | "divergent" => Self::Divergent,
            _ => bail!(
                "unknown profile {:?}, expected P1 (identical), P2 (similar) or P3 (divergent)",
                input
            ),
        })
    }
}
