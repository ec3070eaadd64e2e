/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod benchmark;
pub mod clap_args;
pub mod config;
pub mod disk;
pub mod image;
pub mod launcher;
pub mod mounts;
pub mod pull_client;
pub mod results;

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Log lines go to stdout alongside the progress output.
/// `RUST_LOG` takes priority over `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
