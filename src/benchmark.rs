/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod cleanup;

use crate::{
    config::{BenchConfig, ServerUnderTest},
    disk::{DiskProbe, StatvfsProbe},
    image::extract_name,
    launcher::{
        discovery::DiscoveryPolicy, memory::SamplerKind, Launcher, PeakMemory, TrackedLauncher,
    },
    mounts::{MountReconciler, ProcMounts},
    pull_client::{ImagePuller, TtrpcPuller},
    results::{continuous_key, individual_key, ResultSet, RunResult},
};
use anyhow::Context;
use cleanup::CleanupGuard;
use colored::Colorize;
use std::path::Path;
use tokio::time::Instant;
use tracing::{info, warn};

/// Drives servers through the configured workload and measures them.
pub struct Benchmark {
    config: BenchConfig,
    launcher: Box<dyn Launcher>,
    puller: Box<dyn ImagePuller>,
    disk: Box<dyn DiskProbe>,
    mounts: Box<dyn MountReconciler>,
}
impl Benchmark {
    pub fn new(
        config: BenchConfig,
        launcher: Box<dyn Launcher>,
        puller: Box<dyn ImagePuller>,
        disk: Box<dyn DiskProbe>,
        mounts: Box<dyn MountReconciler>,
    ) -> Self {
        Self {
            config,
            launcher,
            puller,
            disk,
            mounts,
        }
    }

    /// Wires the benchmark to the real OS: `time -v` supervision, the ttrpc socket, statvfs and
    /// the kernel mount table.
    pub fn on_host(config: BenchConfig, sampler: SamplerKind) -> anyhow::Result<Self> {
        let launcher = TrackedLauncher::new(
            &config.wrapper,
            sampler,
            config.settle_delay(),
            DiscoveryPolicy::with_timeout(config.discovery_timeout()),
        )?;
        let puller = TtrpcPuller::new(&config.socket_path, config.pull_deadline());

        Ok(Self::new(
            config,
            Box::new(launcher),
            Box::new(puller),
            Box::new(StatvfsProbe),
            Box::new(ProcMounts::new()),
        ))
    }

    pub fn config(&self) -> &BenchConfig {
        &self.config
    }

    /// Runs every server in individual mode, then every server in continuous mode.
    pub async fn run_all(&self, servers: &[ServerUnderTest]) -> anyhow::Result<ResultSet> {
        let mut results = ResultSet::new();

        for server in servers {
            results.merge(self.run_individual(server).await?);
        }
        for server in servers {
            let result = self.run_continuous(server).await?;
            results.insert(continuous_key(&server.label), result);
        }

        Ok(results)
    }

    /// Measures every image on a fresh server instance with fresh storage.
    pub async fn run_individual(&self, server: &ServerUnderTest) -> anyhow::Result<ResultSet> {
        println!(
            "===== Testing server (individual): {} =====",
            server.label.green()
        );
        let guard = self.guard(server);

        let mut results = ResultSet::new();
        for image in self.config.images.iter() {
            let result = self.measure_image(server, image).await?;
            result.print();
            results.insert(individual_key(image, &server.label), result);
        }

        guard.release()?;
        Ok(results)
    }

    /// Measures the whole workload on a single long lived server instance.
    pub async fn run_continuous(&self, server: &ServerUnderTest) -> anyhow::Result<RunResult> {
        println!(
            "===== Testing server (continuous): {} =====",
            server.label.green()
        );
        self.mounts.cleanup(&server.storage_path)?;
        let guard = self.guard(server);

        let handle = self
            .launcher
            .start(server)
            .await
            .with_context(|| format!("Failed to start server {}", server.label))?;
        tokio::time::sleep(self.config.settle_delay()).await;

        let disk_before = self.disk_usage(&server.storage_path);
        let start = Instant::now();
        for image in self.config.images.iter() {
            self.mounts.cleanup(&self.config.mount_point)?;
            info!("Pulling {}", extract_name(image));
            self.pull(image).await;
        }
        let elapsed = start.elapsed();

        let peak = handle.kill();
        let disk_after = self.disk_usage(&server.storage_path);
        let peak_kbytes = self.peak_memory(peak).await;

        let result = RunResult::from_measurements(elapsed, peak_kbytes, disk_before, disk_after);
        result.print();

        guard.release()?;
        Ok(result)
    }

    async fn measure_image(&self, server: &ServerUnderTest, image: &str) -> anyhow::Result<RunResult> {
        self.mounts.cleanup(&server.storage_path)?;
        self.mounts.cleanup(&self.config.mount_point)?;
        println!("[{}]", extract_name(image).cyan());

        let handle = self
            .launcher
            .start(server)
            .await
            .with_context(|| format!("Failed to start server {}", server.label))?;
        tokio::time::sleep(self.config.settle_delay()).await;

        let disk_before = self.disk_usage(&server.storage_path);
        let start = Instant::now();
        self.pull(image).await;
        let elapsed = start.elapsed();

        let peak = handle.kill();
        let disk_after = self.disk_usage(&server.storage_path);
        let peak_kbytes = self.peak_memory(peak).await;

        Ok(RunResult::from_measurements(
            elapsed,
            peak_kbytes,
            disk_before,
            disk_after,
        ))
    }

    fn guard(&self, server: &ServerUnderTest) -> CleanupGuard<'_> {
        CleanupGuard::new(
            self.mounts.as_ref(),
            vec![
                self.config.mount_point.clone(),
                server.storage_path.clone(),
            ],
        )
    }

    /// A failed pull is a fact about this run, not a reason to stop.
    async fn pull(&self, image: &str) {
        if let Err(err) = self.puller.pull(image, &self.config.mount_point).await {
            warn!("Error pulling image {}: {:#}", image, err);
        }
    }

    fn disk_usage(&self, path: &Path) -> Option<u64> {
        match self.disk.used_bytes(path) {
            Ok(used) => Some(used),
            Err(err) => {
                warn!("Could not get disk usage of {}: {:#}", path.display(), err);
                None
            }
        }
    }

    async fn peak_memory(&self, peak: PeakMemory) -> u64 {
        match peak.wait().await {
            Ok(kbytes) => kbytes,
            Err(err) => {
                warn!("Could not get MaxRSS: {:#}", err);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::ServerHandle;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::{
        path::PathBuf,
        sync::{Arc, Mutex},
        time::Duration,
    };

    type Events = Arc<Mutex<Vec<String>>>;

    fn record(events: &Events, event: String) {
        events.lock().expect("events lock").push(event);
    }

    struct StubLauncher {
        events: Events,
        peak_kbytes: Option<u64>,
        fail: bool,
    }
    #[async_trait]
    impl Launcher for StubLauncher {
        async fn start(&self, server: &ServerUnderTest) -> anyhow::Result<Box<dyn ServerHandle>> {
            if self.fail {
                return Err(anyhow!("no child process found for {}", server.label));
            }
            record(&self.events, format!("start {}", server.label));
            Ok(Box::new(StubHandle {
                events: self.events.clone(),
                peak_kbytes: self.peak_kbytes,
            }))
        }
    }

    struct StubHandle {
        events: Events,
        peak_kbytes: Option<u64>,
    }
    impl ServerHandle for StubHandle {
        fn worker_pid(&self) -> u32 {
            4242
        }

        fn kill(self: Box<Self>) -> PeakMemory {
            record(&self.events, "kill".to_string());
            match self.peak_kbytes {
                Some(kbytes) => PeakMemory::ready(kbytes),
                None => PeakMemory::new(async { Err(anyhow!("MaxRSS not found in output")) }),
            }
        }
    }

    struct StubPuller {
        events: Events,
        latency: Duration,
        fail: bool,
    }
    #[async_trait]
    impl ImagePuller for StubPuller {
        async fn pull(&self, image: &str, _bundle_path: &Path) -> anyhow::Result<()> {
            record(&self.events, format!("pull {}", extract_name(image)));
            tokio::time::sleep(self.latency).await;
            if self.fail {
                Err(anyhow!("Pulling {} exceeded the deadline of 60s", image))
            } else {
                Ok(())
            }
        }
    }

    struct StubDisk(Option<u64>);
    impl DiskProbe for StubDisk {
        fn used_bytes(&self, path: &Path) -> anyhow::Result<u64> {
            self.0
                .ok_or_else(|| anyhow!("cannot stat {}", path.display()))
        }
    }

    struct StubMounts {
        events: Events,
    }
    impl MountReconciler for StubMounts {
        fn cleanup(&self, path: &Path) -> anyhow::Result<()> {
            record(&self.events, format!("cleanup {}", path.display()));
            Ok(())
        }
    }

    struct Fixture {
        events: Events,
        peak_kbytes: Option<u64>,
        launcher_fails: bool,
        latency: Duration,
        pull_fails: bool,
        disk: Option<u64>,
    }
    impl Default for Fixture {
        fn default() -> Self {
            Self {
                events: Events::default(),
                peak_kbytes: Some(204_800),
                launcher_fails: false,
                latency: Duration::from_secs(1),
                pull_fails: false,
                disk: Some(10 << 30),
            }
        }
    }
    impl Fixture {
        fn benchmark(&self) -> Benchmark {
            let config = BenchConfig {
                images: vec![
                    "ghcr.io/org/alpha@sha256:aa".to_string(),
                    "ghcr.io/org/beta@sha256:bb".to_string(),
                ],
                ..BenchConfig::default()
            };
            Benchmark::new(
                config,
                Box::new(StubLauncher {
                    events: self.events.clone(),
                    peak_kbytes: self.peak_kbytes,
                    fail: self.launcher_fails,
                }),
                Box::new(StubPuller {
                    events: self.events.clone(),
                    latency: self.latency,
                    fail: self.pull_fails,
                }),
                Box::new(StubDisk(self.disk)),
                Box::new(StubMounts {
                    events: self.events.clone(),
                }),
            )
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().expect("events lock").clone()
        }
    }

    fn stub_server() -> ServerUnderTest {
        ServerUnderTest {
            label: "stub".to_string(),
            binary: PathBuf::from("/usr/local/bin/stub"),
            args: String::new(),
            storage_path: PathBuf::from("storage"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn individual_mode_records_one_result_per_image() -> anyhow::Result<()> {
        let fixture = Fixture::default();
        let results = fixture.benchmark().run_individual(&stub_server()).await?;

        let expected = RunResult {
            time: 1,
            memory: 200,
            storage: 0,
        };
        assert_eq!(results.len(), 2);
        assert_eq!(results.get("alpha-stub"), Some(&expected));
        assert_eq!(results.get("beta-stub"), Some(&expected));

        let events = fixture.events();
        assert_eq!(
            &events[..5],
            &[
                "cleanup storage",
                "cleanup current_server",
                "start stub",
                "pull alpha",
                "kill"
            ]
        );
        assert_eq!(
            &events[events.len() - 2..],
            &["cleanup current_server", "cleanup storage"]
        );
        assert_eq!(events.iter().filter(|e| *e == "start stub").count(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_mode_uses_one_server_for_the_workload() -> anyhow::Result<()> {
        let fixture = Fixture::default();
        let result = fixture.benchmark().run_continuous(&stub_server()).await?;

        assert!(result.time >= 2);
        assert_eq!(result.memory, 200);
        assert_eq!(result.storage, 0);

        let events = fixture.events();
        assert_eq!(events.iter().filter(|e| *e == "start stub").count(), 1);
        assert_eq!(events.iter().filter(|e| *e == "kill").count(), 1);
        // storage is only reset on entry and exit
        assert_eq!(events.iter().filter(|e| *e == "cleanup storage").count(), 2);
        assert_eq!(
            events
                .iter()
                .filter(|e| *e == "cleanup current_server")
                .count(),
            3
        );
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pull_still_kills_and_cleans_up() -> anyhow::Result<()> {
        let fixture = Fixture {
            latency: Duration::from_secs(60),
            pull_fails: true,
            ..Fixture::default()
        };
        let results = fixture.benchmark().run_individual(&stub_server()).await?;

        assert_eq!(results.len(), 2);
        assert_eq!(results.get("alpha-stub").map(|r| r.time), Some(60));

        let events = fixture.events();
        assert_eq!(events.iter().filter(|e| *e == "kill").count(), 2);
        assert_eq!(events.last().map(String::as_str), Some("cleanup storage"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn launcher_failure_aborts_but_still_cleans_up() {
        let fixture = Fixture {
            launcher_fails: true,
            ..Fixture::default()
        };
        let res = fixture.benchmark().run_individual(&stub_server()).await;
        assert!(res.is_err());

        let events = fixture.events();
        assert!(!events.iter().any(|e| e.starts_with("pull")));
        assert_eq!(
            &events[events.len() - 2..],
            &["cleanup current_server", "cleanup storage"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_measurements_degrade_to_zero() -> anyhow::Result<()> {
        let fixture = Fixture {
            peak_kbytes: None,
            disk: None,
            ..Fixture::default()
        };
        let result = fixture.benchmark().run_continuous(&stub_server()).await?;
        assert_eq!(result.memory, 0);
        assert_eq!(result.storage, 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn run_all_collects_every_mode_and_server() -> anyhow::Result<()> {
        let fixture = Fixture::default();
        let benchmark = fixture.benchmark();
        let servers = benchmark
            .config()
            .servers(Path::new("/bin/imagepuller"), Path::new("/bin/image-rs"));

        let results = benchmark.run_all(&servers).await?;

        let keys = results.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>();
        assert_eq!(
            keys,
            vec![
                "alpha-image-rs",
                "alpha-imagepuller",
                "beta-image-rs",
                "beta-imagepuller",
                "continuous-image-rs",
                "continuous-imagepuller",
            ]
        );
        Ok(())
    }
}
