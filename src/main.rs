/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::path::Path;

use anyhow::Result;
use clap::Parser;
#[cfg(unix)]
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use ::packrat::{common::DEFAULT_CONFIG_FILE, config::Config, Packrat};

#[derive(Parser)]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Validate the config file and print the parsed result
    #[clap(long)]
    check_config: bool,
}

#[cfg(unix)]
fn wait_on_signals() -> Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    signals.forever().next();
    signals.handle().close();
    Ok(())
}

#[cfg(windows)]
fn wait_on_signals() -> Result<()> {
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    if opts.check_config {
        let config = Config::load_from_file(&opts.config_file)?;
        println!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }
    let packrat = Packrat::start(Path::new(&opts.config_file))?;
    wait_on_signals()?;
    packrat.stop();

    Ok(())
}
