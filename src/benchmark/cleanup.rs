/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::mounts::MountReconciler;
use std::path::PathBuf;
use tracing::error;

/// Tears down storage and mount state when an experiment ends, however it ends. Paths are cleaned
/// in the order given.
pub struct CleanupGuard<'a> {
    mounts: &'a dyn MountReconciler,
    paths: Vec<PathBuf>,
    released: bool,
}
impl<'a> CleanupGuard<'a> {
    pub fn new(mounts: &'a dyn MountReconciler, paths: Vec<PathBuf>) -> Self {
        Self {
            mounts,
            paths,
            released: false,
        }
    }

    /// Tears down now and reports the first failure. Every path is attempted regardless.
    pub fn release(mut self) -> anyhow::Result<()> {
        self.released = true;
        self.teardown()
    }

    fn teardown(&self) -> anyhow::Result<()> {
        let mut first_err = None;
        for path in self.paths.iter() {
            if let Err(err) = self.mounts.cleanup(path) {
                error!("Cleanup of {} failed: {:#}", path.display(), err);
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            // failures are already logged by teardown
            let _ = self.teardown();
        }
    }
}
