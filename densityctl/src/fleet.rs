// Copyright (c) Facebook, Inc. and its affiliates.
//
// Spawning, liveness probing and teardown of a batch of workload
// processes. A Fleet owns its children exclusively and reaps all of them
// when torn down or dropped.
use anyhow::Result;
use log::{debug, info, trace, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Unknown,
    Alive,
    Exited,
}

#[derive(Debug)]
pub struct WorkloadHandle {
    idx: usize,
    child: Child,
    state: Liveness,
}

impl WorkloadHandle {
    fn new(idx: usize, child: Child) -> Self {
        Self {
            idx,
            child,
            state: Liveness::Unknown,
        }
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Non-blocking. An exited child is reaped here and stays Exited.
    pub fn probe(&mut self) -> Liveness {
        if self.state == Liveness::Exited {
            return self.state;
        }
        self.state = match self.child.try_wait() {
            Ok(Some(status)) => {
                trace!("fleet: workload {} exited ({})", self.idx, status);
                Liveness::Exited
            }
            Ok(None) => Liveness::Alive,
            Err(e) => {
                debug!("fleet: failed to probe workload {} ({})", self.idx, &e);
                Liveness::Unknown
            }
        };
        self.state
    }

    fn terminate(&mut self) -> Result<()> {
        if self.probe() != Liveness::Exited {
            kill(Pid::from_raw(self.pid() as i32), Signal::SIGTERM)?;
        }
        Ok(())
    }

    fn kill_and_reap(&mut self) {
        if let Err(e) = self.child.kill() {
            trace!("fleet: kill workload {} ({})", self.idx, &e);
        }
        match self.child.wait() {
            Ok(_) => self.state = Liveness::Exited,
            Err(e) => debug!("fleet: failed to reap workload {} ({})", self.idx, &e),
        }
    }
}

/// How long teardown waits for SIGTERM to take effect before SIGKILL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeardownPolicy {
    pub poll_intv: Duration,
    pub timeout: Duration,
}

impl Default for TeardownPolicy {
    fn default() -> Self {
        Self {
            poll_intv: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("failed to launch workload {idx}, {} already running were torn down: {source}", .rolled_back.len())]
pub struct LaunchError {
    pub idx: usize,
    /// PIDs of the workloads launched before the failure.
    pub rolled_back: Vec<u32>,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug)]
pub struct Fleet {
    handles: Vec<WorkloadHandle>,
    policy: TeardownPolicy,
}

impl Fleet {
    /// Launch `nr` workloads with the commands built by `cmd_fn`. Either all
    /// of them are started or none is left running.
    pub fn spawn<F>(nr: usize, policy: TeardownPolicy, mut cmd_fn: F) -> Result<Self, LaunchError>
    where
        F: FnMut(usize) -> Command,
    {
        let mut fleet = Self {
            handles: Vec::with_capacity(nr),
            policy,
        };

        for idx in 0..nr {
            let mut cmd = cmd_fn(idx);
            cmd.stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());

            match cmd.spawn() {
                Ok(child) => {
                    debug!("fleet: started workload {} (pid {})", idx, child.id());
                    fleet.handles.push(WorkloadHandle::new(idx, child));
                }
                Err(e) => {
                    let rolled_back = fleet.pids();
                    warn!(
                        "fleet: failed to start workload {}/{} ({}), rolling back",
                        idx, nr, &e
                    );
                    fleet.teardown();
                    return Err(LaunchError {
                        idx,
                        rolled_back,
                        source: e,
                    });
                }
            }
        }

        Ok(fleet)
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.handles.iter().map(|h| h.pid()).collect()
    }

    pub fn count_alive(&mut self) -> usize {
        self.handles
            .iter_mut()
            .map(|h| h.probe())
            .filter(|s| *s == Liveness::Alive)
            .count()
    }

    fn count_not_exited(&mut self) -> usize {
        self.handles
            .iter_mut()
            .map(|h| h.probe())
            .filter(|s| *s != Liveness::Exited)
            .count()
    }

    /// SIGTERM everyone, wait up to the policy timeout, then SIGKILL and
    /// reap whatever is left. Errors are logged and swallowed. Calling it
    /// again after completion is a no-op.
    pub fn teardown(&mut self) {
        if self.is_empty() {
            return;
        }

        let nr = self.len();
        for h in self.handles.iter_mut() {
            if let Err(e) = h.terminate() {
                debug!("fleet: failed to SIGTERM workload {} ({:#})", h.idx(), &e);
            }
        }

        let deadline = Instant::now() + self.policy.timeout;
        loop {
            let nr_left = self.count_not_exited();
            if nr_left == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(
                    "fleet: {}/{} workloads still running after {:.1}s, killing",
                    nr_left,
                    nr,
                    self.policy.timeout.as_secs_f64()
                );
                break;
            }
            sleep(self.policy.poll_intv);
        }

        for h in self.handles.iter_mut() {
            h.kill_and_reap();
        }
        self.handles.clear();
        info!("fleet: {} workloads stopped", nr);
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.teardown();
    }
}
