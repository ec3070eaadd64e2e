/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::image::extract_name;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use tracing::warn;

const BYTES_PER_MB: i64 = 1024 * 1024;

/// Figures recorded for a single run. Every field is truncated to a whole unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    /// Elapsed wall clock time in seconds.
    pub time: i64,
    /// Peak resident set size in MB.
    pub memory: i64,
    /// Storage delta in MB, negative if the server freed space.
    pub storage: i64,
}
impl RunResult {
    /// `disk_before`/`disk_after` are `None` when the probe failed, in which case no delta is
    /// reported.
    pub fn from_measurements(
        elapsed: Duration,
        peak_kbytes: u64,
        disk_before: Option<u64>,
        disk_after: Option<u64>,
    ) -> Self {
        let storage = match (disk_before, disk_after) {
            (Some(before), Some(after)) => (after as i64 - before as i64) / BYTES_PER_MB,
            _ => 0,
        };

        Self {
            time: elapsed.as_secs() as i64,
            memory: (peak_kbytes / 1024) as i64,
            storage,
        }
    }

    pub fn print(&self) {
        println!("Time taken: {} s", self.time.to_string().green());
        println!("Memory peak: {} MB", self.memory.to_string().green());
        println!("Storage used: {} MB", self.storage.to_string().green());
        println!();
    }
}

pub fn individual_key(image: &str, label: &str) -> String {
    format!("{}-{}", extract_name(image), label)
}

pub fn continuous_key(label: &str) -> String {
    format!("continuous-{}", label)
}

/// All results of a benchmark, keyed by run. Serializes as a plain JSON object with sorted keys.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultSet {
    results: BTreeMap<String, RunResult>,
}
impl ResultSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a result. An existing entry with the same key is replaced.
    pub fn insert(&mut self, key: String, result: RunResult) {
        if let Some(previous) = self.results.insert(key.clone(), result) {
            warn!(
                "Result for {} was recorded twice, discarding {:?}",
                key, previous
            );
        }
    }

    pub fn merge(&mut self, other: ResultSet) {
        for (key, result) in other.results {
            self.insert(key, result);
        }
    }

    pub fn get(&self, key: &str) -> Option<&RunResult> {
        self.results.get(key)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RunResult)> {
        self.results.iter()
    }

    pub fn to_json_pretty(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
