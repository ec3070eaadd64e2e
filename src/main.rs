/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use pullbench::{benchmark::Benchmark, clap_args, config::BenchConfig, init_tracing};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let Some(args) = clap_args::parse() else {
        return Ok(());
    };

    let config = match &args.config {
        Some(path) => BenchConfig::try_from_path(path)?,
        None => BenchConfig::default(),
    };
    info!(
        "Benchmarking {} images against {}",
        config.images.len(),
        config.socket_path.display()
    );

    let servers = config.servers(&args.imagepuller, &args.image_rs);
    let benchmark = Benchmark::on_host(config, args.sampler)?;
    let results = benchmark.run_all(&servers).await?;

    println!("{}", results.to_json_pretty()?);
    Ok(())
}
