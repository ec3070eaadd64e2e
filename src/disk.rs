/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use std::path::Path;

pub trait DiskProbe: Send + Sync {
    /// Bytes in use on the filesystem holding `path`.
    fn used_bytes(&self, path: &Path) -> anyhow::Result<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    fn used_bytes(&self, path: &Path) -> anyhow::Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path)
            .with_context(|| format!("Failed to stat filesystem of {}", path.display()))?;

        let used_blocks = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64);
        Ok(used_blocks * stat.fragment_size() as u64)
    }
}
