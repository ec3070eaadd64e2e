/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::anyhow;
use itertools::Itertools;
use std::time::Duration;
use sysinfo::{Pid, System};
use tokio::time::Instant;
use tracing::{debug, trace};

/// How long to keep looking for the worker a supervisor forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}
impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        }
    }
}
impl DiscoveryPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Picks the worker out of the supervisor's direct children. Anything but exactly one child is
/// ambiguous.
pub fn select_worker(supervisor_pid: u32, children: &[u32]) -> anyhow::Result<u32> {
    match children {
        [worker] => Ok(*worker),
        [] => Err(anyhow!(
            "No child process found for supervisor PID {}",
            supervisor_pid
        )),
        _ => Err(anyhow!(
            "Supervisor PID {} has {} children, expected exactly one: {:?}",
            supervisor_pid,
            children.len(),
            children
        )),
    }
}

/// Direct child processes of `parent_pid` in a freshly refreshed process table. The table also
/// lists threads under their owning process, those are skipped.
pub fn children_of(system: &mut System, parent_pid: u32) -> Vec<u32> {
    system.refresh_all();
    let parent = Pid::from_u32(parent_pid);
    system
        .processes()
        .iter()
        .filter(|(pid, process)| {
            **pid != parent && process.thread_kind().is_none() && process.parent() == Some(parent)
        })
        .map(|(pid, _)| pid.as_u32())
        .sorted()
        .collect()
}

/// Polls the process table with exponential backoff until the supervisor has forked its worker.
/// More than one child fails immediately; no child fails once the policy's timeout is spent.
pub async fn discover_worker(supervisor_pid: u32, policy: &DiscoveryPolicy) -> anyhow::Result<u32> {
    let mut system = System::new();
    let deadline = Instant::now() + policy.timeout;
    let mut backoff = policy.initial_backoff;

    loop {
        let children = children_of(&mut system, supervisor_pid);
        trace!("children of {}: {:?}", supervisor_pid, children);

        if !children.is_empty() || Instant::now() >= deadline {
            let worker = select_worker(supervisor_pid, &children)?;
            debug!("Discovered worker {} of supervisor {}", worker, supervisor_pid);
            return Ok(worker);
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(policy.max_backoff);
    }
}
