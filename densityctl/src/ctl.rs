// Copyright (c) Facebook, Inc. and its affiliates.
//
// enable, disable and status subcommands.
use anyhow::Result;
use density_util::ksm::{self, KsmKnobs, KsmRun};
use density_util::*;
use densityctl_intf::Args;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::Path;
use std::time::Duration;

use super::estimate::estimate_saved_mib;

fn knobs_from_args(args: &Args) -> KsmKnobs {
    KsmKnobs {
        path: args.ksm_path.clone(),
        pages_to_scan: args.pages_to_scan,
        sleep_millisecs: args.sleep_ms,
        merge_across_nodes: args.merge_across_nodes,
    }
}

fn format_write(dir: &str, name: &str, val: i64) -> String {
    format!("{} <- {}", Path::new(dir).join(name).display(), val)
}

pub fn enable_plan(knobs: &KsmKnobs) -> Vec<String> {
    let dir = &knobs.path;
    let mut plan = vec![
        format_write(dir, "pages_to_scan", knobs.pages_to_scan as i64),
        format_write(dir, "sleep_millisecs", knobs.sleep_millisecs as i64),
    ];
    if let Some(v) = knobs.merge_across_nodes {
        plan.push(format_write(dir, "merge_across_nodes", v as i64));
    }
    plan.push(format_write(dir, "run", KsmRun::Merge as i64));
    plan
}

pub fn disable_plan(dir: &str, unmerge: bool, timeout: Duration) -> Vec<String> {
    let mut plan = vec![];
    if unmerge {
        plan.push(format_write(dir, "run", KsmRun::Unmerge as i64));
        plan.push(format!(
            "wait up to {} for {} to reach 0",
            format_duration(timeout.as_secs_f64()),
            ksm::PAGES_SHARED
        ));
    }
    plan.push(format_write(dir, "run", KsmRun::Stop as i64));
    plan
}

fn print_plan(plan: &[String]) {
    println!("dry-run, would do:");
    for line in plan.iter() {
        println!("  {}", line);
    }
}

pub fn enable(args: &Args) -> Result<()> {
    let knobs = knobs_from_args(args);
    if args.dry_run {
        print_plan(&enable_plan(&knobs));
        return Ok(());
    }
    ksm::enable(&knobs)
}

pub fn disable(args: &Args, exit: &ProgExit) -> Result<()> {
    let timeout = Duration::from_secs_f64(args.unmerge_timeout.max(0.0));
    if args.dry_run {
        print_plan(&disable_plan(&args.ksm_path, args.unmerge, timeout));
        return Ok(());
    }
    ksm::disable(&args.ksm_path, args.unmerge, timeout, exit)
}

pub fn format_status(st: &BTreeMap<String, i64>, page_size: usize) -> String {
    let width = st.keys().map(|k| k.len()).max().unwrap_or(0);
    let mut buf = String::new();
    for (key, val) in st.iter() {
        writeln!(buf, "{:width$} : {}", key, val, width = width).unwrap();
    }
    writeln!(
        buf,
        "\nestimated saving: {:.1}MiB",
        estimate_saved_mib(Some(st), page_size)
    )
    .unwrap();
    buf
}

pub fn status(args: &Args) -> Result<()> {
    let st = ksm::status(&args.ksm_path)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&st)?);
    } else {
        print!("{}", format_status(&st, *PAGE_SIZE));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_plans() {
        let knobs = KsmKnobs {
            path: "/sys/kernel/mm/ksm".into(),
            pages_to_scan: 100,
            sleep_millisecs: 20,
            merge_across_nodes: None,
        };
        assert_eq!(
            enable_plan(&knobs),
            vec![
                "/sys/kernel/mm/ksm/pages_to_scan <- 100",
                "/sys/kernel/mm/ksm/sleep_millisecs <- 20",
                "/sys/kernel/mm/ksm/run <- 1",
            ]
        );

        let plan = disable_plan("/k", true, Duration::from_secs(60));
        assert_eq!(plan.len(), 3);
        assert_eq!(plan[0], "/k/run <- 2");
        assert_eq!(plan[2], "/k/run <- 0");
        assert_eq!(disable_plan("/k", false, Duration::from_secs(60)), vec!["/k/run <- 0"]);
    }

    #[test]
    fn test_format_status() {
        let mut st = BTreeMap::new();
        st.insert("pages_shared".to_string(), 10);
        st.insert("pages_sharing".to_string(), 266);
        st.insert("run".to_string(), 1);
        let out = format_status(&st, 4096);
        assert!(out.contains("pages_shared  : 10\n"));
        assert!(out.contains("run           : 1\n"));
        assert!(out.ends_with("estimated saving: 1.0MiB\n"));
    }

    #[test]
    fn test_dry_run_leaves_knobs_alone() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run"), "0\n").unwrap();

        let mut args = Args::default();
        args.ksm_path = dir.path().to_str().unwrap().to_string();
        args.dry_run = true;
        enable(&args).unwrap();
        assert_eq!(ksm::read_knob(&args.ksm_path, "run").unwrap(), 0);

        args.dry_run = false;
        fs::write(dir.path().join("pages_to_scan"), "0\n").unwrap();
        fs::write(dir.path().join("sleep_millisecs"), "0\n").unwrap();
        enable(&args).unwrap();
        assert_eq!(ksm::read_knob(&args.ksm_path, "run").unwrap(), 1);
        assert_eq!(ksm::read_knob(&args.ksm_path, "pages_to_scan").unwrap(), 100);
    }
}
