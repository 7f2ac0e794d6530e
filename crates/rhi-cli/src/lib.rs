//! rhiexec - package installer for Rhino
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Installs `.rhi` packages (plug-ins, localization, help, tutorials and UI
//! files) for every compatible Rhino installation on the machine.
//!
//! # Process model
//!
//! One binary plays three roles, selected by subcommand:
//!
//! - `install` runs the engine for one package.
//! - `inspect-host` / `inspect-plugin` are probe children: they read one
//!   binary, write a descriptor file and exit with a phase code. The engine
//!   launches them per architecture so a bad binary can never take the
//!   installer down.
//! - `install-bundled-packages` runs `install` as a child for every package
//!   shipped with a host.
//!
//! The exit code is always the final [`Phase`](rhi_schema::Phase) code.

pub mod cmd;
pub mod console;
pub mod logging;

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "rhiexec")]
#[command(author, version, about = "rhiexec - installs .rhi packages for Rhino")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Flags accepted by every subcommand and forwarded to child processes.
#[derive(Debug, Clone, Default, Args)]
pub struct GlobalArgs {
    /// No console output
    #[arg(long, global = true)]
    pub silent: bool,

    /// Append the log to this file instead of stderr
    #[arg(long, global = true, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// debug, info, warning or error (default: $RUST_LOG, else info)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Install for every user on the machine
    #[arg(long, global = true)]
    pub all_users: bool,

    /// Locale of the bundled packages to install
    #[arg(long, global = true, default_value = "en-US")]
    pub locale: String,

    /// Never suggest filing an error report
    #[arg(long, global = true)]
    pub no_error_reports: bool,

    /// Engine configuration file (default: $RHIEXEC_CONFIG)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Flags a child process needs to log and behave like its parent.
    pub fn passthrough(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::new();
        if self.silent {
            args.push("--silent".into());
        }
        if let Some(file) = &self.log_file {
            args.push("--log-file".into());
            args.push(file.into());
        }
        if let Some(level) = &self.log_level {
            args.push("--log-level".into());
            args.push(level.into());
        }
        if self.no_error_reports {
            args.push("--no-error-reports".into());
        }
        if let Some(config) = &self.config {
            args.push("--config".into());
            args.push(config.into());
        }
        args
    }
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Install a package
    Install {
        /// Path to the .rhi package
        package: Option<PathBuf>,
    },
    /// Inspect a host executable and write its descriptor
    #[command(name = "inspect-host")]
    InspectHost {
        /// Host executable
        exe: PathBuf,
        /// Folder the descriptor is written to
        #[arg(long)]
        workdir: PathBuf,
    },
    /// Inspect a plug-in binary and write its descriptor beside it
    #[command(name = "inspect-plugin")]
    InspectPlugin {
        /// Plug-in binary (.rhp)
        plugin: PathBuf,
    },
    /// Install the packages shipped with a host
    #[command(name = "install-bundled-packages")]
    InstallBundledPackages {
        /// Folder holding the .rhi files
        #[arg(long)]
        folder: PathBuf,
        /// SDK service release of the host; packages are skipped when this
        /// release was already handled
        #[arg(long)]
        sdk_version: u32,
    },
}
