// Copyright (c) Facebook, Inc. and its affiliates.
use density_util::JsonLoad;
use densityctl_intf::{Profile, RunResult};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_densityctl");

fn densityctl(args: &[&str]) -> Output {
    Command::new(BIN).args(args).output().unwrap()
}

fn fake_ksm_dir(dir: &Path) -> PathBuf {
    let ksm = dir.join("ksm");
    fs::create_dir_all(&ksm).unwrap();
    for (name, val) in &[
        ("run", "0"),
        ("pages_to_scan", "100"),
        ("sleep_millisecs", "20"),
        ("merge_across_nodes", "1"),
        ("pages_shared", "0"),
        ("pages_sharing", "0"),
        ("full_scans", "0"),
    ] {
        fs::write(ksm.join(name), format!("{}\n", val)).unwrap();
    }
    ksm
}

fn read_knob(ksm: &Path, name: &str) -> i64 {
    fs::read_to_string(ksm.join(name))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

fn wait_timeout(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return Some(status);
        }
        sleep(Duration::from_millis(50));
    }
    None
}

#[test]
fn test_usage_errors() {
    assert_eq!(densityctl(&[]).status.code(), Some(2));
    assert_eq!(densityctl(&["bogus"]).status.code(), Some(2));
    assert_eq!(densityctl(&["bench", "--no-such-flag"]).status.code(), Some(2));
    assert_eq!(densityctl(&["--help"]).status.code(), Some(0));
}

#[test]
fn test_bench_config_errors() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("results");
    let out_str = out.to_str().unwrap();

    for args in &[
        vec!["bench", "--out", out_str],
        vec!["bench", "--scale", "5..3", "--out", out_str],
        vec!["bench", "--scale", "0..10", "--out", out_str],
        vec!["bench", "--scale", "10..80..0", "--out", out_str],
        vec!["bench", "--instances", "2", "--profile", "P9", "--out", out_str],
        vec!["bench", "--instances", "2", "--mem-mib", "0", "--out", out_str],
    ] {
        let output = densityctl(args);
        assert_eq!(output.status.code(), Some(1), "{:?}", args);
    }
    assert!(!out.exists());
}

#[test]
fn test_ksm_status_enable_disable() {
    let dir = tempfile::tempdir().unwrap();
    let ksm = fake_ksm_dir(dir.path());
    let ksm_str = ksm.to_str().unwrap();

    let output = densityctl(&["status", "--ksm-path", ksm_str, "--json"]);
    assert!(output.status.success());
    let st: BTreeMap<String, i64> = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(st["pages_to_scan"], 100);
    assert_eq!(st["run"], 0);

    let output = densityctl(&["enable", "--ksm-path", ksm_str, "--dry-run"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("run <- 1"));
    assert_eq!(read_knob(&ksm, "run"), 0);

    let output = densityctl(&[
        "enable",
        "--ksm-path",
        ksm_str,
        "--pages-to-scan",
        "500",
        "--sleep-ms",
        "10",
        "--merge-across-nodes",
        "0",
    ]);
    assert!(output.status.success());
    assert_eq!(read_knob(&ksm, "run"), 1);
    assert_eq!(read_knob(&ksm, "pages_to_scan"), 500);
    assert_eq!(read_knob(&ksm, "sleep_millisecs"), 10);
    assert_eq!(read_knob(&ksm, "merge_across_nodes"), 0);

    let output = densityctl(&["disable", "--ksm-path", ksm_str, "--timeout-sec", "2"]);
    assert!(output.status.success());
    assert_eq!(read_knob(&ksm, "run"), 0);

    let empty = dir.path().join("empty");
    fs::create_dir_all(&empty).unwrap();
    assert_eq!(
        densityctl(&["status", "--ksm-path", empty.to_str().unwrap()])
            .status
            .code(),
        Some(1)
    );
}

#[test]
fn test_args_file() {
    let dir = tempfile::tempdir().unwrap();
    let ksm = fake_ksm_dir(dir.path());
    let args_path = dir.path().join("args.json");

    let output = densityctl(&[
        "-a",
        args_path.to_str().unwrap(),
        "status",
        "--ksm-path",
        ksm.to_str().unwrap(),
    ]);
    assert!(output.status.success());

    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&args_path).unwrap()).unwrap();
    assert_eq!(saved["ksm_path"], ksm.to_str().unwrap());

    // the saved path is picked up without repeating it
    let output = densityctl(&["-a", args_path.to_str().unwrap(), "status", "--json"]);
    assert!(output.status.success());
}

#[test]
fn test_hog_runs_until_terminated() {
    for sig in &[Signal::SIGTERM, Signal::SIGINT] {
        let mut child = Command::new(BIN)
            .args(&[
                "__hog",
                "--mem-mib",
                "4",
                "--id",
                "1",
                "--dirty-pct",
                "50",
                "--redirty-ms",
                "10",
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        sleep(Duration::from_millis(500));
        assert!(child.try_wait().unwrap().is_none());

        kill(Pid::from_raw(child.id() as i32), *sig).unwrap();
        let status = wait_timeout(&mut child, Duration::from_secs(10));
        if status.is_none() {
            let _ = child.kill();
            let _ = child.wait();
        }
        assert_eq!(status.and_then(|s| s.code()), Some(0), "{:?}", sig);
    }
}

#[test]
fn test_hog_rejects_bad_params() {
    for args in &[
        vec!["__hog", "--mem-mib", "0"],
        vec!["__hog", "--mem-mib", "-4"],
        vec!["__hog", "--mem-mib", "4", "--dirty-pct", "101"],
        vec!["__hog", "--mem-mib", "9223372036854775807"],
    ] {
        let mut child = Command::new(BIN)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let status = wait_timeout(&mut child, Duration::from_secs(10));
        if status.is_none() {
            let _ = child.kill();
            let _ = child.wait();
        }
        assert_eq!(status.and_then(|s| s.code()), Some(1), "{:?}", args);
    }
}

#[test]
fn test_bench_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let ksm = fake_ksm_dir(dir.path());
    let out = dir.path().join("results");
    let publish = dir.path().join("pub/latest.json");

    let output = densityctl(&[
        "bench",
        "--profile",
        "P1",
        "--scale",
        "1..2",
        "--mem-mib",
        "4",
        "--warmup-sec",
        "0.1",
        "--out",
        out.to_str().unwrap(),
        "--ksm-path",
        ksm.to_str().unwrap(),
        "--publish",
        publish.to_str().unwrap(),
    ]);
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );

    let jsons: Vec<PathBuf> = fs::read_dir(&out)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().unwrap().to_string_lossy().to_string();
            name.starts_with("bench_p1_") && name.ends_with(".json")
        })
        .collect();
    assert_eq!(jsons.len(), 1);

    let res = RunResult::load(&jsons[0]).unwrap();
    assert_eq!(res.profile, Profile::Identical);
    assert_eq!(res.steps.len(), 2);
    assert_eq!(res.steps[0].n, 1);
    assert_eq!(res.steps[1].n, 2);
    for step in res.steps.iter() {
        assert!(step.alive <= step.n);
        assert!(step.estimated_saved_mib >= 0.0);
        assert!(!step.aborted);
        assert!(step.post_ksm.is_some());
    }

    let md = fs::read_to_string(out.join("report.md")).unwrap();
    assert!(md.contains("| N | Alive | Saved (MiB) |"));
    assert_eq!(RunResult::load(&publish).unwrap().steps.len(), 2);
}
