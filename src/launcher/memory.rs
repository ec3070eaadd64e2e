/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::{anyhow, Context};
use std::{fs, path::PathBuf};

static MAX_RSS_MARKER: &str = "Maximum resident set size (kbytes)";

/// Source of a worker's peak resident set size.
pub trait MemorySampler: Send {
    /// Called while the worker is still alive, right before it gets killed.
    fn observe(&mut self, worker_pid: u32) -> anyhow::Result<()>;

    /// Peak memory in kbytes, called once the supervisor has exited. `diagnostics` is everything
    /// the supervisor wrote to stderr.
    fn peak_kbytes(&self, diagnostics: &str) -> anyhow::Result<u64>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SamplerKind {
    /// Parse the report `time -v` prints on exit
    #[default]
    Time,
    /// Read the high water mark from `/proc/<pid>/status` before the kill
    ProcStatus,
}
impl SamplerKind {
    pub fn build(self) -> Box<dyn MemorySampler> {
        match self {
            SamplerKind::Time => Box::new(TimeReportSampler),
            SamplerKind::ProcStatus => Box::new(ProcStatusSampler::default()),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TimeReportSampler;

impl MemorySampler for TimeReportSampler {
    fn observe(&mut self, _worker_pid: u32) -> anyhow::Result<()> {
        Ok(())
    }

    fn peak_kbytes(&self, diagnostics: &str) -> anyhow::Result<u64> {
        parse_max_rss(diagnostics)
    }
}

/// Scans a `time -v` report for the maximum resident set size line.
pub fn parse_max_rss(report: &str) -> anyhow::Result<u64> {
    for line in report.lines().filter(|line| line.contains(MAX_RSS_MARKER)) {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() < 6 {
            continue;
        }
        let last = fields[fields.len() - 1];
        return last
            .parse::<u64>()
            .with_context(|| format!("Parsing MaxRSS failed, got {:?}", last));
    }
    Err(anyhow!("MaxRSS not found in output"))
}

#[derive(Debug, Clone)]
pub struct ProcStatusSampler {
    proc_root: PathBuf,
    peak: Option<u64>,
}
impl Default for ProcStatusSampler {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            peak: None,
        }
    }
}
impl MemorySampler for ProcStatusSampler {
    fn observe(&mut self, worker_pid: u32) -> anyhow::Result<()> {
        let status_path = self.proc_root.join(worker_pid.to_string()).join("status");
        let status = fs::read_to_string(&status_path)
            .with_context(|| format!("Failed to read {}", status_path.display()))?;
        self.peak = Some(
            parse_vm_hwm(&status)
                .with_context(|| format!("No VmHWM in {}", status_path.display()))?,
        );
        Ok(())
    }

    fn peak_kbytes(&self, _diagnostics: &str) -> anyhow::Result<u64> {
        self.peak
            .ok_or_else(|| anyhow!("Worker was not observed before it exited"))
    }
}

fn parse_vm_hwm(status: &str) -> anyhow::Result<u64> {
    let line = status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .ok_or_else(|| anyhow!("VmHWM not found"))?;
    let kbytes = line
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("VmHWM has no value"))?;
    Ok(kbytes.parse()?)
}
