// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{anyhow, Context, Result};
use log::info;
use scan_fmt::scan_fmt;
use simplelog as sl;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub mod json_file;
pub mod ksm;
pub mod page_area;
pub mod proc;

pub use json_file::{
    JsonArgs, JsonArgsHelper, JsonConfigFile, JsonLoad, JsonReportFile, JsonSave,
};
pub use page_area::PageArea;

lazy_static::lazy_static! {
    pub static ref PAGE_SIZE: usize = ::page_size::get();
    pub static ref NR_SYSTEM_CPUS: usize = ::num_cpus::get();
    pub static ref TOTAL_SYSTEM_MEMORY: usize = {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.total_memory() as usize
    };
    pub static ref TOTAL_SYSTEM_SWAP: usize = {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        sys.total_swap() as usize
    };
}

fn format_size_internal<T>(size: T, zero: &str) -> String
where
    T: num::ToPrimitive,
{
    let format_size_helper = |size: u64, shift: u32, suffix: &str| -> Option<String> {
        let unit: u64 = 1 << shift;

        if (size as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (size as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (size as f64 / unit as f64) < 1024.0 {
            Some(format!("{:.0}{}", size as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let size = size.to_u64().unwrap_or(0);

    if size == 0 {
        zero.to_string()
    } else if size < 9999 {
        format!("{}", size)
    } else {
        format_size_helper(size, 10, "K")
            .or_else(|| format_size_helper(size, 20, "M"))
            .or_else(|| format_size_helper(size, 30, "G"))
            .or_else(|| format_size_helper(size, 40, "P"))
            .or_else(|| format_size_helper(size, 50, "E"))
            .unwrap_or_else(|| "INF".into())
    }
}

pub fn format_size<T>(size: T) -> String
where
    T: num::ToPrimitive,
{
    format_size_internal(size, "0")
}

pub fn format_size_dashed<T>(size: T) -> String
where
    T: num::ToPrimitive,
{
    format_size_internal(size, "-")
}

fn format_duration_internal(dur: f64, zero: &str) -> String {
    let format_nsecs_helper = |nsecs: u64, unit: u64, max: u64, suffix: &str| -> Option<String> {
        if nsecs == 0 {
            Some(zero.to_string())
        } else if (nsecs as f64 / unit as f64) < 99.95 {
            Some(format!(
                "{:.1}{}",
                (nsecs as f64 / unit as f64).max(0.1),
                suffix
            ))
        } else if (nsecs as f64 / unit as f64) < max as f64 {
            Some(format!("{:.0}{}", nsecs as f64 / unit as f64, suffix))
        } else {
            None
        }
    };

    let nsecs = (dur * 1_000_000_000.0).round() as u64;

    format_nsecs_helper(nsecs, 10_u64.pow(0), 1000, "n")
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(3), 1000, "u"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(6), 1000, "m"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9), 60, "s"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60, 60, "M"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60, 24, "H"))
        .or_else(|| format_nsecs_helper(nsecs, 10_u64.pow(9) * 60 * 60 * 24, 365, "D"))
        .unwrap_or_else(|| "INF".into())
}

pub fn format_duration(dur: f64) -> String {
    format_duration_internal(dur, "0")
}

pub fn parse_duration(input: &str) -> Result<f64> {
    lazy_static::lazy_static! {
        static ref UNITS: HashMap<char, f64> = [
            ('n', 0.000_000_001),
            ('u', 0.000_001),
            ('m', 0.001),
            ('s', 1.0),
            ('M', 60.0),
            ('H', 3600.0),
            ('D', 3600.0 * 24.0),
        ]
            .iter()
            .cloned()
            .collect();
    }

    let mut num = String::new();
    let mut sum = 0.0;
    for ch in input.chars() {
        match ch {
            '_' => continue,
            ch if UNITS.contains_key(&ch) => {
                sum += num
                    .trim()
                    .parse::<f64>()
                    .with_context(|| format!("failed to parse duration {:?}", input))?
                    * UNITS[&ch];
                num.clear();
            }
            ch => num.push(ch),
        }
    }
    if num.trim().len() > 0 {
        sum += num
            .trim()
            .parse::<f64>()
            .with_context(|| format!("failed to parse duration {:?}", input))?;
    }
    if sum < 0.0 {
        anyhow::bail!("duration {:?} is negative", input);
    }
    Ok(sum)
}

pub fn read_one_line<P: AsRef<Path>>(path: P) -> Result<String> {
    let f = fs::OpenOptions::new().read(true).open(path)?;
    let r = BufReader::new(f);
    Ok(r.lines().next().ok_or(anyhow!("File empty"))??)
}

pub fn write_one_line<P: AsRef<Path>>(path: P, line: &str) -> Result<()> {
    let mut f = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)?;
    Ok(f.write_all(line.as_ref())?)
}

/// Parse "KEY VALUE" lines such as /proc/vmstat or "KEY: VALUE kB" lines
/// such as /proc/meminfo. Trailing colons on keys are dropped and lines
/// which don't parse are skipped. If `want` is not empty, only the listed
/// keys are kept.
pub fn parse_flat_keyed<R: BufRead>(r: R, want: &[&str]) -> BTreeMap<String, u64> {
    let mut map = BTreeMap::new();

    for line in r.lines().filter_map(Result::ok) {
        if let Ok((key, val)) = scan_fmt!(&line, "{} {d}", String, u64) {
            let key = key.trim_end_matches(':');
            if want.is_empty() || want.contains(&key) {
                map.insert(key.to_string(), val);
            }
        }
    }
    map
}

pub fn read_flat_keyed_file<P: AsRef<Path>>(path: P, want: &[&str]) -> Result<BTreeMap<String, u64>> {
    let f = fs::OpenOptions::new()
        .read(true)
        .open(path.as_ref())
        .with_context(|| format!("opening {:?}", path.as_ref()))?;
    Ok(parse_flat_keyed(BufReader::new(f), want))
}

pub fn init_logging(verbosity: u32) {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    } else {
        let sl_level = match verbosity {
            0 | 1 => sl::LevelFilter::Info,
            2 => sl::LevelFilter::Debug,
            _ => sl::LevelFilter::Trace,
        };
        let mut lcfg = sl::ConfigBuilder::new();
        lcfg.set_time_level(sl::LevelFilter::Off)
            .set_location_level(sl::LevelFilter::Off)
            .set_target_level(sl::LevelFilter::Off)
            .set_thread_level(sl::LevelFilter::Off);
        if !console::user_attended_stderr()
            || sl::TermLogger::init(
                sl_level,
                lcfg.build(),
                sl::TerminalMode::Stderr,
                sl::ColorChoice::Auto,
            )
            .is_err()
        {
            let _ = sl::SimpleLogger::init(sl_level, lcfg.build());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgState {
    Running,
    Exiting,
}

/// Shared "stop requested" flag. SIGINT and SIGTERM both end up here; the
/// waiters are woken up immediately when it's set.
#[derive(Debug, Clone, Default)]
pub struct ProgExit {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl ProgExit {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn set_exiting(&self) {
        let (lock, waitq) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        waitq.notify_all();
    }

    pub fn exiting(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sleep for `dur` unless exit is requested in the meantime.
    pub fn wait(&self, dur: Duration) -> ProgState {
        let (lock, waitq) = &*self.inner;
        let deadline = Instant::now() + dur;
        let mut exiting = lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if *exiting {
                return ProgState::Exiting;
            }
            let now = Instant::now();
            if now >= deadline {
                return ProgState::Running;
            }
            exiting = waitq
                .wait_timeout(exiting, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn wait_exit(&self) {
        let (lock, waitq) = &*self.inner;
        let mut exiting = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*exiting {
            exiting = waitq.wait(exiting).unwrap_or_else(|e| e.into_inner());
        }
    }
}

/// Install the SIGINT/SIGTERM handler. Can only be called once per process.
pub fn setup_prog_state() -> Result<ProgExit> {
    let exit = ProgExit::new();
    let handler_exit = exit.clone();
    ctrlc::set_handler(move || {
        info!("SIGINT/TERM received, exiting...");
        handler_exit.set_exiting();
    })
    .context("setting termination handler")?;
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_write_one_line_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("knob");
        fs::write(&path, "100\n").unwrap();
        write_one_line(&path, "5").unwrap();
        assert_eq!(read_one_line(&path).unwrap(), "5");
    }

    #[test]
    fn test_format_duration() {
        for pair in &[
            (0.000003932, "3.9u"),
            (0.00448, "4.5m"),
            (0.3, "300m"),
            (2042.0, "34.0M"),
            (3456000.0, "40.0D"),
        ] {
            let result = super::format_duration(pair.0);
            assert_eq!(&result, pair.1);
        }
    }

    #[test]
    fn test_parse_duration() {
        for pair in &[
            (0.0044, "4.4m"),
            (0.3, "300m"),
            (20.0, "20"),
            (20.0, "20s"),
            (90.0, "1M30s"),
            (1.37, "100m1.27"),
        ] {
            let result = super::parse_duration(pair.1).unwrap();
            assert!((pair.0 - result).abs() < 1e-9, "{} -> {}", pair.1, result);
        }
        assert!(super::parse_duration("abc").is_err());
        assert!(super::parse_duration("-5").is_err());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0");
        assert_eq!(format_size(4096), "4096");
        assert_eq!(format_size(256 << 20), "256M");
        assert_eq!(format_size_dashed(0), "-");
    }

    #[test]
    fn test_parse_flat_keyed() {
        let meminfo = "MemTotal:       16318776 kB\n\
                       MemFree:         1234567 kB\n\
                       MemAvailable:    8000000 kB\n\
                       Buffers:           12345 kB\n\
                       HugePages_Total:       0\n";
        let map = parse_flat_keyed(meminfo.as_bytes(), &["MemTotal", "MemAvailable"]);
        assert_eq!(map.len(), 2);
        assert_eq!(map["MemTotal"], 16318776);
        assert_eq!(map["MemAvailable"], 8000000);

        let vmstat = "pswpin 12\npswpout 34\nbogus\n";
        let map = parse_flat_keyed(vmstat.as_bytes(), &[]);
        assert_eq!(map["pswpin"], 12);
        assert_eq!(map["pswpout"], 34);
        assert!(!map.contains_key("bogus"));
    }

    #[test]
    fn test_prog_exit_wait() {
        let exit = ProgExit::new();
        assert_eq!(exit.wait(Duration::from_millis(10)), ProgState::Running);
        assert!(!exit.exiting());

        let setter = exit.clone();
        let jh = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            setter.set_exiting();
        });

        let started_at = Instant::now();
        assert_eq!(exit.wait(Duration::from_secs(30)), ProgState::Exiting);
        assert!(started_at.elapsed() < Duration::from_secs(10));
        jh.join().unwrap();

        assert!(exit.exiting());
        assert_eq!(exit.wait(Duration::from_secs(30)), ProgState::Exiting);
        exit.wait_exit();
    }
}
