/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

static DEFAULT_IMAGES: &[&str] = &[
    "ghcr.io/edgelesssys/contrast/dmesg:v0.0.1@sha256:6ad6bbb5735b84b10af42d2441e8d686b1d9a6cbf096b53842711ef5ddabd28d",
    "ghcr.io/charludo/contrast/coordinator@sha256:6f966a922cc9a39d7047ed41ffafc7eb7a3c6a4fd8966cbf30fa902b455789f7",
    "quay.io/quay/busybox@sha256:92f3298bf80a1ba949140d77987f5de081f010337880cd771f7e7fc928f8c74d",
    "ghcr.io/edgelesssys/nginx-unprivileged@sha256:1d5be2aa3c296bd589ddd3c9bf2f560919e31ac32bae799a15dd182b6fdb042b",
    "quay.io/prometheus/prometheus@sha256:f20d3127bf2876f4a1df76246fca576b41ddf1125ed1c546fbd8b16ea55117e6",
    "ghcr.io/charludo/contrast/initializer@sha256:25b5ff1bd5259b6bd8c112b2321b8dc1857a9e63e0f2698c7ed4929c71ae514d",
];

static DEFAULT_SOCKET: &str = "/run/confidential-containers/cdh.sock";

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct BenchConfig {
    /// Ordered workload. Every server pulls exactly these images.
    pub images: Vec<String>,

    /// Bundle path handed to the server; reset before every pull.
    pub mount_point: PathBuf,

    /// Unix socket the pull servers listen on.
    pub socket_path: PathBuf,

    /// Resource accounting wrapper, looked up on `PATH`.
    pub wrapper: String,

    pub settle_ms: u64,
    pub discovery_timeout_ms: u64,
    pub pull_timeout_secs: u64,

    pub imagepuller: ServerProfile,
    #[serde(rename = "image-rs")]
    pub image_rs: ServerProfile,
}
impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            images: DEFAULT_IMAGES.iter().map(|s| s.to_string()).collect(),
            mount_point: PathBuf::from("current_server"),
            socket_path: PathBuf::from(DEFAULT_SOCKET),
            wrapper: "time".to_string(),
            settle_ms: 500,
            discovery_timeout_ms: 5_000,
            pull_timeout_secs: 60,
            imagepuller: ServerProfile {
                label: "imagepuller".to_string(),
                args: "--tmpdir=tmp_imagepuller".to_string(),
                storage_path: PathBuf::from("tmp_imagepuller"),
            },
            image_rs: ServerProfile {
                label: "image-rs".to_string(),
                args: String::new(),
                storage_path: PathBuf::from("/run/kata-containers"),
            },
        }
    }
}
impl BenchConfig {
    pub fn try_from_path(path: &Path) -> anyhow::Result<BenchConfig> {
        let conf_str = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config file {}", path.display()))?;
        BenchConfig::try_from_str(&conf_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<BenchConfig> {
        let config = toml::from_str::<BenchConfig>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.mount_point.as_os_str().is_empty() {
            anyhow::bail!("mount_point must not be empty");
        }
        for profile in [&self.imagepuller, &self.image_rs] {
            if profile.storage_path.as_os_str().is_empty() {
                anyhow::bail!("storage_path of server {} must not be empty", profile.label);
            }
        }
        Ok(())
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn pull_deadline(&self) -> Duration {
        Duration::from_secs(self.pull_timeout_secs)
    }

    /// Pairs the two server binaries given on the command line with their profiles.
    pub fn servers(&self, imagepuller: &Path, image_rs: &Path) -> Vec<ServerUnderTest> {
        vec![
            ServerUnderTest::new(&self.imagepuller, imagepuller),
            ServerUnderTest::new(&self.image_rs, image_rs),
        ]
    }
}

/// How one server implementation is invoked and where it keeps its data.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerProfile {
    pub label: String,
    #[serde(default)]
    pub args: String,
    pub storage_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerUnderTest {
    pub label: String,
    pub binary: PathBuf,
    /// Arguments as a single POSIX command line fragment.
    pub args: String,
    pub storage_path: PathBuf,
}
impl ServerUnderTest {
    pub fn new(profile: &ServerProfile, binary: &Path) -> Self {
        Self {
            label: profile.label.clone(),
            binary: binary.to_path_buf(),
            args: profile.args.clone(),
            storage_path: profile.storage_path.clone(),
        }
    }

    pub fn split_args(&self) -> anyhow::Result<Vec<String>> {
        shlex::split(&self.args).with_context(|| {
            format!(
                "Arguments for server {} are not POSIX compliant: {}",
                self.label, self.args
            )
        })
    }
}
