/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::launcher::memory::SamplerKind;
use clap::{error::ErrorKind, Parser};
use std::{ffi::OsString, path::PathBuf};

pub static USAGE: &str = "Usage: pullbench /path/to/imagepuller /path/to/image-rs";

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// The imagepuller server binary
    pub imagepuller: PathBuf,

    /// The image-rs server binary
    pub image_rs: PathBuf,

    /// TOML file overriding the built in benchmark configuration
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// How peak memory is measured
    #[arg(short, long, value_enum, default_value_t = SamplerKind::Time)]
    pub sampler: SamplerKind,
}

/// Parses the process arguments. Returns `None` after printing the usage line when the number of
/// server paths is wrong.
pub fn parse() -> Option<Args> {
    parse_from(std::env::args_os())
}

pub fn parse_from<I, T>(itr: I) -> Option<Args>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    match Args::try_parse_from(itr) {
        Ok(args) => Some(args),
        Err(err) if is_wrong_arity(err.kind()) => {
            println!("{}", USAGE);
            None
        }
        Err(err) => err.exit(),
    }
}

fn is_wrong_arity(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::MissingRequiredArgument | ErrorKind::UnknownArgument | ErrorKind::TooManyValues
    )
}
