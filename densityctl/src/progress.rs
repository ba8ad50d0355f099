// Copyright (c) Facebook, Inc. and its affiliates.
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::time::{Duration, Instant};

/// Spinner on an attended terminal, periodic log lines otherwise.
pub struct WarmupProgress {
    bar: Option<ProgressBar>,
    last_log_at: Option<Instant>,
}

impl WarmupProgress {
    const LOG_INTV: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        let bar = if console::user_attended_stderr() {
            let bar = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            {
                bar.set_style(style);
            }
            bar.enable_steady_tick(Duration::from_millis(100));
            Some(bar)
        } else {
            None
        };

        Self {
            bar,
            last_log_at: None,
        }
    }

    pub fn set_status(&mut self, status: &str) {
        match self.bar.as_ref() {
            Some(bar) => bar.set_message(status.to_string()),
            None => {
                let due = match self.last_log_at {
                    Some(at) => at.elapsed() >= Self::LOG_INTV,
                    None => true,
                };
                if due {
                    info!("{}", status);
                    self.last_log_at = Some(Instant::now());
                }
            }
        }
    }
}

impl Drop for WarmupProgress {
    fn drop(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
