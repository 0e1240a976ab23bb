// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! The gateway binary.

use baudtime::{
    config::Config,
    setup::{run_server, setup_logger},
};
use clap::Parser;
use logger::warn;

#[derive(Parser, Debug)]
#[command(name = "baudtime-gateway", about = "Sharded time-series gateway")]
struct Args {
    /// Path of the toml config file.
    #[arg(short, long)]
    config: Option<String>,
}

fn main() {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path).expect("Failed to load config"),
        None => Config::default(),
    };

    let _logger = setup_logger(&config);
    if args.config.is_none() {
        warn!("No config file given, running with defaults");
    }

    run_server(config);
}
