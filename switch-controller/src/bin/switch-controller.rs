// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable for the switch controller

use anyhow::anyhow;
use camino::Utf8PathBuf;
use clap::Parser;
use cutover_common::cmd::{fatal, CmdError};
use cutover_switch_controller::{Config, Server};

#[derive(Debug, Parser)]
#[clap(
    name = "switch-controller",
    about = "Drives blue/green switches of a worker fleet"
)]
enum Args {
    /// Start the switch controller
    Run {
        #[clap(name = "CONFIG_FILE_PATH", action)]
        config_file_path: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(cmd_error) = do_run().await {
        fatal(cmd_error);
    }
}

async fn do_run() -> Result<(), CmdError> {
    let args = Args::parse();

    match args {
        Args::Run { config_file_path } => {
            let config = Config::from_file(&config_file_path).map_err(|e| {
                CmdError::Config(
                    anyhow!(e).context(format!("loading {config_file_path}")),
                )
            })?;
            let server = Server::start_with_config(config)
                .await
                .map_err(|e| CmdError::Failure(anyhow!(e)))?;

            tokio::signal::ctrl_c().await.map_err(|e| {
                CmdError::Failure(anyhow!(e).context("waiting for interrupt"))
            })?;
            server.close().await.map_err(|e| CmdError::Failure(anyhow!(e)))
        }
    }
}
