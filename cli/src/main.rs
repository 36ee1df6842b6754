// BiPact: execution core for two-party off-chain contracts
//
// SPDX-License-Identifier: Apache-2.0
//
// Designed in 2024-2025 by the BiPact developers
// Written in 2024-2025 by the BiPact developers
//
// Copyright (C) 2024-2025 BiPact developers.
// All rights under the above copyrights are reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//        http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

#[macro_use]
extern crate clap;

mod cmd;
mod dump;

use std::path::PathBuf;

use bipact::RuntimeConfig;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cmd::Cmd;

#[derive(Parser)]
#[command(author, version, about)]
pub struct Args {
    /// Configuration file; defaults are used if not given
    #[clap(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory overriding the one from the configuration
    #[clap(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Cmd,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    args.cmd.exec(&config)
}
