// Copyright (c) Facebook, Inc. and its affiliates.
//
// Run artifacts: the json record, the markdown summary and the optional
// published copy of the record.
use anyhow::{Context, Result};
use chrono::{DateTime, Local, SecondsFormat};
use density_util::*;
use densityctl_intf::{Profile, RunResult};
use log::{debug, warn};
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};

pub const MARKDOWN_NAME: &str = "report.md";

pub fn json_path(out_dir: &Path, profile: Profile, at: &DateTime<Local>) -> PathBuf {
    out_dir.join(format!(
        "bench_{}_{}.json",
        profile.tag().to_lowercase(),
        at.format("%Y%m%d_%H%M%S")
    ))
}

pub fn format_markdown(res: &RunResult) -> String {
    let mut buf = String::new();

    writeln!(buf, "# DENSITY Bench Report\n").unwrap();
    writeln!(
        buf,
        "- Started: {}",
        res.started_at.to_rfc3339_opts(SecondsFormat::Secs, false)
    )
    .unwrap();
    writeln!(buf, "- Profile: {}", res.profile).unwrap();
    writeln!(
        buf,
        "- Host: {} CPUs, {} memory, {} swap, page size {}",
        res.host.nr_cpus,
        format_size(res.host.total_memory),
        format_size_dashed(res.host.total_swap),
        format_size(res.host.page_size)
    )
    .unwrap();
    writeln!(
        buf,
        "- Per instance: {}MiB, warmup {}\n",
        res.mem_mib,
        format_duration(res.warmup)
    )
    .unwrap();

    writeln!(
        buf,
        "| N | Alive | Saved (MiB) | ksmd ticks Δ | MemAvailable before (MiB) | MemAvailable after (MiB) |"
    )
    .unwrap();
    writeln!(buf, "|---:|---:|---:|---:|---:|---:|").unwrap();
    for step in res.steps.iter() {
        writeln!(
            buf,
            "| {} | {} | {:.1} | {} | {:.1} | {:.1} |",
            step.n,
            step.alive,
            step.estimated_saved_mib,
            step.ksmd_ticks_delta
                .map(|v| v.to_string())
                .unwrap_or("-".into()),
            step.pre_mem_avail_mib(),
            step.post_mem_avail_mib()
        )
        .unwrap();
    }

    writeln!(
        buf,
        "\n**Note:** \"Saved\" is estimated from the KSM counters as \
         (pages_sharing - pages_shared) * page size and depends on the workload."
    )
    .unwrap();

    let noted: Vec<_> = res.steps.iter().filter(|s| !s.notes.is_empty()).collect();
    if !noted.is_empty() {
        writeln!(buf, "\n## Notes\n").unwrap();
        for step in noted {
            writeln!(buf, "- N={}: {}", step.n, &step.notes).unwrap();
        }
    }

    buf
}

/// Write the json record and the markdown summary into `out_dir` and
/// publish the record if requested. Only failures to write the record are
/// reported. Returns the path of the record.
pub fn persist(res: &RunResult, out_dir: &Path, publish: Option<&Path>) -> Result<PathBuf> {
    let path = json_path(out_dir, res.profile, &Local::now());
    JsonReportFile::new(&path, res.clone())
        .commit()
        .with_context(|| format!("saving {:?}", &path))?;
    debug!("report: saved {:?}", &path);

    let md_path = out_dir.join(MARKDOWN_NAME);
    match fs::write(&md_path, format_markdown(res)) {
        Ok(()) => debug!("report: saved {:?}", &md_path),
        Err(e) => warn!("report: failed to write {:?} ({})", &md_path, &e),
    }

    if let Some(publish) = publish {
        JsonReportFile::new(publish, res.clone())
            .commit()
            .with_context(|| format!("publishing to {:?}", publish))?;
        debug!("report: published to {:?}", publish);
    }

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use densityctl_intf::StepResult;
    use std::collections::BTreeMap;

    fn test_result() -> RunResult {
        let mut ok = StepResult::new(10, Profile::Similar, 64, 20.0);
        ok.alive = 10;
        ok.estimated_saved_mib = 123.456;
        ok.ksmd_ticks_delta = Some(42);
        let mut mem = BTreeMap::new();
        mem.insert("MemAvailable".to_string(), 1024 * 1024);
        ok.pre_mem_kb = Some(mem.clone());
        mem.insert("MemAvailable".to_string(), 512 * 1024);
        ok.post_mem_kb = Some(mem);

        let mut aborted = StepResult::new(20, Profile::Similar, 64, 20.0);
        aborted.aborted = true;
        aborted.add_note("launch failed at workload 3: boom");

        RunResult {
            started_at: Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap(),
            profile: Profile::Similar,
            mem_mib: 64,
            warmup: 20.0,
            instances: vec![10, 20],
            steps: vec![ok, aborted],
            ..Default::default()
        }
    }

    #[test]
    fn test_json_path() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 6).unwrap();
        assert_eq!(
            json_path(Path::new("results"), Profile::Divergent, &at),
            PathBuf::from("results/bench_p3_20240309_140506.json")
        );
    }

    #[test]
    fn test_markdown() {
        let md = format_markdown(&test_result());
        assert!(md.starts_with("# DENSITY Bench Report\n"));
        assert!(md.contains("- Profile: P2\n"));
        assert!(md.contains("- Started: 2024-03-09T14:05:06"));
        assert!(md.contains(
            "| N | Alive | Saved (MiB) | ksmd ticks Δ | MemAvailable before (MiB) | MemAvailable after (MiB) |\n"
        ));
        assert!(md.contains("| 10 | 10 | 123.5 | 42 | 1024.0 | 512.0 |\n"));
        assert!(md.contains("| 20 | 0 | 0.0 | - | 0.0 | 0.0 |\n"));
        assert!(md.contains("- N=20: launch failed at workload 3: boom\n"));
    }

    #[test]
    fn test_persist() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("results");
        fs::create_dir_all(&out).unwrap();
        let publish = dir.path().join("pub/latest.json");

        let res = test_result();
        let path = persist(&res, &out, Some(publish.as_path())).unwrap();
        assert!(path.starts_with(&out));
        assert!(out.join(MARKDOWN_NAME).exists());

        let loaded = RunResult::load(&path).unwrap();
        assert_eq!(loaded.steps.len(), 2);
        assert_eq!(loaded.profile, Profile::Similar);
        assert!(loaded.steps[1].aborted);
        assert_eq!(RunResult::load(&publish).unwrap().steps[0].ksmd_ticks_delta, Some(42));
    }

    #[test]
    fn test_persist_failure() {
        let dir = tempfile::tempdir().unwrap();
        // a regular file where the output directory should be
        let out = dir.path().join("results");
        fs::write(&out, "").unwrap();
        assert!(persist(&test_result(), &out, None).is_err());
    }
}
