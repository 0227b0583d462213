// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Exit handling shared by the `switch-controller` and `switch-sidecar`
//! executables

use std::process::exit;

/// A fatal error in one of the cutover executables.
///
/// Usage errors never reach here: clap reports them and exits with status 2
/// on its own.
#[derive(Debug)]
pub enum CmdError {
    /// the configuration file could not be loaded
    Config(anyhow::Error),
    /// the process started but then failed
    Failure(anyhow::Error),
}

impl CmdError {
    fn exit_code(&self) -> i32 {
        match self {
            CmdError::Config(_) => 3,
            CmdError::Failure(_) => 1,
        }
    }
}

/// Reports `cmd_error` on stderr, prefixed with the executable's name, and
/// exits.
pub fn fatal(cmd_error: CmdError) -> ! {
    let arg0 = std::env::current_exe()
        .ok()
        .and_then(|path| {
            path.file_name().map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| String::from("cutover"));
    let code = cmd_error.exit_code();
    match cmd_error {
        CmdError::Config(e) => eprintln!("{arg0}: bad configuration: {e:#}"),
        CmdError::Failure(e) => eprintln!("{arg0}: {e:#}"),
    }
    exit(code);
}
