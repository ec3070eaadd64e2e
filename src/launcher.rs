/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod discovery;
pub mod memory;

use crate::config::ServerUnderTest;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use discovery::DiscoveryPolicy;
use futures_util::{future::BoxFuture, FutureExt};
use memory::{MemorySampler, SamplerKind};
use nix::{sys::signal, unistd::Pid};
use std::{
    env,
    ffi::OsStr,
    future::Future,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};
use sysinfo::System;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Starts servers under test.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn start(&self, server: &ServerUnderTest) -> anyhow::Result<Box<dyn ServerHandle>>;
}

/// A running server. Killing it consumes the handle, after that only its peak memory remains.
pub trait ServerHandle: Send {
    fn worker_pid(&self) -> u32;

    /// Unconditionally kills the worker.
    fn kill(self: Box<Self>) -> PeakMemory;
}

/// Deferred peak memory reading of a killed server, in kbytes.
pub struct PeakMemory {
    pending: BoxFuture<'static, anyhow::Result<u64>>,
}
impl PeakMemory {
    pub fn new(pending: impl Future<Output = anyhow::Result<u64>> + Send + 'static) -> Self {
        Self {
            pending: pending.boxed(),
        }
    }

    pub fn ready(kbytes: u64) -> Self {
        Self::new(async move { Ok(kbytes) })
    }

    /// Waits for the server to exit and extracts its peak memory.
    pub async fn wait(self) -> anyhow::Result<u64> {
        self.pending.await
    }
}

/// Runs servers as `<wrapper> -v <server> [args]` so the wrapper can account for the server's
/// resource usage.
#[derive(Debug, Clone)]
pub struct TrackedLauncher {
    wrapper: PathBuf,
    sampler: SamplerKind,
    settle: Duration,
    discovery: DiscoveryPolicy,
}
impl TrackedLauncher {
    /// Fails if the wrapper cannot be found on `PATH`.
    pub fn new(
        wrapper: &str,
        sampler: SamplerKind,
        settle: Duration,
        discovery: DiscoveryPolicy,
    ) -> anyhow::Result<Self> {
        let wrapper = locate_wrapper(wrapper, env::var_os("PATH").as_deref())?;
        info!("Using resource accounting wrapper {}", wrapper.display());

        Ok(Self {
            wrapper,
            sampler,
            settle,
            discovery,
        })
    }

    fn spawn_supervisor(&self, server: &ServerUnderTest) -> anyhow::Result<Child> {
        let args = server.split_args()?;
        debug!(
            "Running {} -v {} {:?}",
            self.wrapper.display(),
            server.binary.display(),
            args
        );

        Command::new(&self.wrapper)
            .arg("-v")
            .arg(&server.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to start server {}", server.binary.display()))
    }
}

#[async_trait]
impl Launcher for TrackedLauncher {
    async fn start(&self, server: &ServerUnderTest) -> anyhow::Result<Box<dyn ServerHandle>> {
        let mut supervisor = self.spawn_supervisor(server)?;
        let supervisor_pid = supervisor
            .id()
            .ok_or_else(|| anyhow!("Supervisor of {} exited immediately", server.label))?;

        let mut stderr = supervisor
            .stderr
            .take()
            .context("Supervisor stderr should be piped")?;
        let diagnostics = tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            Ok::<_, std::io::Error>(buf)
        });

        tokio::time::sleep(self.settle).await;

        let worker_pid = match discovery::discover_worker(supervisor_pid, &self.discovery).await {
            Ok(worker_pid) => worker_pid,
            Err(err) => {
                // the supervisor dies with its handle, whatever it forked would be orphaned
                kill_children(supervisor_pid);
                return Err(err.context(format!(
                    "Failed to find server child PID of {}",
                    server.label
                )));
            }
        };
        info!(
            "Started {} (supervisor {}, worker {})",
            server.label, supervisor_pid, worker_pid
        );

        Ok(Box::new(TrackedServer {
            worker: Worker::new(worker_pid),
            supervisor,
            supervisor_pid,
            diagnostics,
            sampler: self.sampler.build(),
        }))
    }
}

/// The worker of a running server. SIGKILLed when dropped unless it was killed already, the
/// supervisor's `kill_on_drop` does not reach it.
struct Worker {
    pid: u32,
    killed: bool,
}
impl Worker {
    fn new(pid: u32) -> Self {
        Self { pid, killed: false }
    }

    fn kill(&mut self) {
        self.killed = true;
        sigkill(self.pid);
    }
}
impl Drop for Worker {
    fn drop(&mut self) {
        if !self.killed {
            debug!("Killing worker {} of a dropped server handle", self.pid);
            self.kill();
        }
    }
}

struct TrackedServer {
    // dropped before the supervisor
    worker: Worker,
    supervisor: Child,
    supervisor_pid: u32,
    diagnostics: JoinHandle<std::io::Result<Vec<u8>>>,
    sampler: Box<dyn MemorySampler>,
}
impl ServerHandle for TrackedServer {
    fn worker_pid(&self) -> u32 {
        self.worker.pid
    }

    fn kill(self: Box<Self>) -> PeakMemory {
        let TrackedServer {
            mut worker,
            mut supervisor,
            supervisor_pid,
            diagnostics,
            mut sampler,
        } = *self;

        if let Err(err) = sampler.observe(worker.pid) {
            warn!("Unable to observe worker {} before kill: {:#}", worker.pid, err);
        }
        worker.kill();

        PeakMemory::new(async move {
            let status = supervisor
                .wait()
                .await
                .with_context(|| format!("Failed to wait for supervisor {}", supervisor_pid))?;
            debug!("Supervisor {} exited with {}", supervisor_pid, status);

            let buf = diagnostics
                .await
                .context("Diagnostics reader panicked")?
                .with_context(|| format!("Failed to read stderr of supervisor {}", supervisor_pid))?;
            sampler.peak_kbytes(&String::from_utf8_lossy(&buf))
        })
    }
}

fn sigkill(pid: u32) {
    if let Err(err) = signal::kill(Pid::from_raw(pid as i32), signal::Signal::SIGKILL) {
        warn!("Failed to kill process {}: {}", pid, err);
    }
}

fn kill_children(supervisor_pid: u32) {
    for child in discovery::children_of(&mut System::new(), supervisor_pid) {
        debug!("Killing child {} of supervisor {}", child, supervisor_pid);
        sigkill(child);
    }
}

/// Resolves the wrapper against a `PATH` style list, names containing a `/` are taken as paths.
fn locate_wrapper(wrapper: &str, path_var: Option<&OsStr>) -> anyhow::Result<PathBuf> {
    let cwd = env::current_dir().context("Failed to read the working directory")?;
    which::which_in(wrapper, path_var, cwd)
        .with_context(|| format!("Error finding {} binary", wrapper))
}
