/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use itertools::Itertools;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

static PROC_MOUNTINFO: &str = "/proc/self/mountinfo";

/// Resets storage state between runs.
pub trait MountReconciler: Send + Sync {
    /// Unmounts everything mounted under `path` and removes `path` recursively. Succeeds silently
    /// when nothing is mounted and nothing exists.
    fn cleanup(&self, path: &Path) -> anyhow::Result<()>;
}

/// Reconciles against the kernel mount table of the current mount namespace.
#[derive(Debug, Clone)]
pub struct ProcMounts {
    mount_table: PathBuf,
}
impl Default for ProcMounts {
    fn default() -> Self {
        Self {
            mount_table: PathBuf::from(PROC_MOUNTINFO),
        }
    }
}
impl ProcMounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads mounts from a file in `mountinfo` format other than the one in `/proc`.
    pub fn with_mount_table(mount_table: impl Into<PathBuf>) -> Self {
        Self {
            mount_table: mount_table.into(),
        }
    }

    fn mount_targets(&self) -> anyhow::Result<Vec<String>> {
        let table = fs::read_to_string(&self.mount_table).with_context(|| {
            format!(
                "Failed to read mount table {}",
                self.mount_table.display()
            )
        })?;
        Ok(parse_mountinfo(&table))
    }
}
impl MountReconciler for ProcMounts {
    fn cleanup(&self, path: &Path) -> anyhow::Result<()> {
        let prefix = path.to_string_lossy();
        if prefix.is_empty() {
            anyhow::bail!("Refusing to clean up an empty path");
        }

        for mount_point in mounts_under(self.mount_targets()?, &prefix) {
            info!("Unmounting {}", mount_point);
            nix::mount::umount(mount_point.as_str())
                .with_context(|| format!("Failed to unmount {}", mount_point))?;
        }

        match fs::remove_dir_all(path) {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("Failed to remove directory {}", path.display()))
            }
        }
    }
}

/// Selects the mount targets containing `prefix` and orders them deepest first, so that no mount
/// point is unmounted while something is still mounted beneath it.
pub fn mounts_under(targets: Vec<String>, prefix: &str) -> Vec<String> {
    targets
        .into_iter()
        .filter(|target| target.contains(prefix))
        .sorted_by(|a, b| depth(b).cmp(&depth(a)))
        .collect()
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

/// Extracts the mount point column (the 5th field) of every `mountinfo` line.
fn parse_mountinfo(table: &str) -> Vec<String> {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(unescape)
        .collect()
}

/// Undoes the octal escaping the kernel applies to spaces, tabs, newlines and backslashes.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let code =
                (bytes[i + 1] - b'0') * 64 + (bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0');
            out.push(code);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits[0] <= b'3' && digits.iter().all(|d| (b'0'..=b'7').contains(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    static MOUNTINFO: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 0:35 / /run rw,nosuid shared:5 - tmpfs tmpfs rw
51 40 0:44 / /run/kata-containers/shared rw shared:20 - tmpfs tmpfs rw
52 51 0:45 / /run/kata-containers/shared/containers/abc/rootfs rw shared:21 - overlay overlay rw
53 40 0:46 / /run/kata-containers rw shared:22 - tmpfs tmpfs rw
60 22 0:50 / /home/bench/current_server rw shared:30 - overlay overlay rw
61 22 0:51 / /home/bench/with\\040space rw shared:31 - tmpfs tmpfs rw
";

    #[test]
    fn mount_points_are_parsed_and_unescaped() {
        let targets = parse_mountinfo(MOUNTINFO);
        assert_eq!(targets.len(), 7);
        assert_eq!(targets[0], "/");
        assert_eq!(targets[6], "/home/bench/with space");
    }

    #[test]
    fn nested_mounts_come_before_their_parents() {
        let ordered = mounts_under(parse_mountinfo(MOUNTINFO), "/run/kata-containers");
        assert_eq!(
            ordered,
            vec![
                "/run/kata-containers/shared/containers/abc/rootfs",
                "/run/kata-containers/shared",
                "/run/kata-containers",
            ]
        );
    }

    #[test]
    fn unmount_order_never_increases_in_depth() {
        let targets = vec![
            "/a".to_string(),
            "/a/b/c/d".to_string(),
            "/x/a/b".to_string(),
            "/a/b".to_string(),
            "/a/b/c".to_string(),
            "/unrelated/deep/deeper/deepest".to_string(),
        ];
        let ordered = mounts_under(targets, "/a");
        assert_eq!(ordered.len(), 5);
        for pair in ordered.windows(2) {
            assert!(depth(&pair[0]) >= depth(&pair[1]), "{:?}", pair);
        }
    }

    #[test]
    fn relative_prefix_matches_as_substring() {
        let ordered = mounts_under(parse_mountinfo(MOUNTINFO), "current_server");
        assert_eq!(ordered, vec!["/home/bench/current_server"]);
    }

    #[test]
    fn cleanup_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mount_table = dir.path().join("mountinfo");
        fs::write(&mount_table, "22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw\n")?;

        let storage = dir.path().join("storage");
        fs::create_dir_all(storage.join("layers/sha256"))?;
        fs::write(storage.join("layers/sha256/blob"), b"data")?;

        let reconciler = ProcMounts::with_mount_table(&mount_table);
        reconciler.cleanup(&storage)?;
        assert!(!storage.exists());

        reconciler.cleanup(&storage)?;
        assert!(!storage.exists());
        Ok(())
    }

    #[test]
    fn unreadable_mount_table_is_fatal() {
        let reconciler = ProcMounts::with_mount_table("/nonexistent/mountinfo");
        let err = reconciler
            .cleanup(Path::new("/nonexistent/storage"))
            .expect_err("cleanup should fail");
        assert!(err.to_string().contains("/nonexistent/mountinfo"));
    }

    #[test]
    fn empty_path_is_refused() {
        let reconciler = ProcMounts::new();
        assert!(reconciler.cleanup(Path::new("")).is_err());
    }
}
