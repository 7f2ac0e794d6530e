//! Host and plugin probing.
//!
//! Binaries are never inspected in the engine's own process. The engine
//! re-invokes `rhiexec` (or a configured per-architecture build of it) with
//! an `inspect-host` or `inspect-plugin` directive; the child parses the PE
//! image, writes a descriptor XML file and exits with a [`Phase`] code.

pub mod discovery;
pub mod inspect;
pub mod pe;
pub mod sdk_table;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use rhi_schema::{HostError, Phase};
use wait_timeout::ChildExt;

use crate::config::ProbeConfig;

pub use discovery::{HostCandidate, discover_hosts, registry_candidates};

/// Architecture a probe child runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeArch {
    X86,
    X64,
}

impl std::fmt::Display for ProbeArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::X86 => "x86",
            Self::X64 => "x64",
        })
    }
}

/// Whether this engine build is 64-bit.
pub fn engine_is_64_bit() -> bool {
    cfg!(target_pointer_width = "64")
}

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed PE image {path}: {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("Not a supported binary: {0}")]
    Unsupported(String),

    #[error("Failed to launch probe {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Descriptor(#[from] HostError),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl ProbeError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl std::fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }

    /// Exit phase a probe child reports for this error.
    pub fn phase(&self) -> Phase {
        match self {
            Self::Unsupported(_) => Phase::NotCompatible,
            _ => Phase::InspectFailed,
        }
    }
}

/// Runs probes and reports their exit phase.
///
/// Descriptor files are the only output: `inspect_host` writes into
/// `workdir`, `inspect_plugin` writes beside the plugin.
pub trait ProbeRunner: Send + Sync {
    fn inspect_host(&self, exe: &Path, workdir: &Path, arch: ProbeArch) -> Phase;

    fn inspect_plugin(&self, plugin: &Path, arch: ProbeArch) -> Phase;

    /// Whether 64-bit probes can run on this machine.
    fn can_run_64_bit(&self) -> bool;
}

/// Argument lists understood by the probe child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    InspectHost { exe: PathBuf, workdir: PathBuf },
    InspectPlugin { plugin: PathBuf },
}

impl Directive {
    pub fn args(&self) -> Vec<OsString> {
        match self {
            Self::InspectHost { exe, workdir } => vec![
                "inspect-host".into(),
                exe.into(),
                "--workdir".into(),
                workdir.into(),
            ],
            Self::InspectPlugin { plugin } => vec!["inspect-plugin".into(), plugin.into()],
        }
    }
}

/// [`ProbeRunner`] that launches child processes.
#[derive(Debug, Clone)]
pub struct ProcessProbeRunner {
    x86: PathBuf,
    x64: PathBuf,
    timeout: Duration,
    passthrough: Vec<OsString>,
}

impl ProcessProbeRunner {
    /// Probe executables from `config`, defaulting to the running binary.
    pub fn from_config(config: &ProbeConfig) -> Result<Self, ProbeError> {
        let current = || {
            std::env::current_exe().map_err(|source| ProbeError::Io {
                path: PathBuf::from("<current executable>"),
                source,
            })
        };
        let x86 = match &config.x86 {
            Some(path) => path.clone(),
            None => current()?,
        };
        let x64 = match &config.x64 {
            Some(path) => path.clone(),
            None => current()?,
        };
        Ok(Self {
            x86,
            x64,
            timeout: Duration::from_secs(config.timeout_secs),
            passthrough: Vec::new(),
        })
    }

    /// Global flags forwarded to every child (logging, silence).
    pub fn with_passthrough(mut self, args: Vec<OsString>) -> Self {
        self.passthrough = args;
        self
    }

    fn executable(&self, arch: ProbeArch) -> &Path {
        match arch {
            ProbeArch::X86 => &self.x86,
            ProbeArch::X64 => &self.x64,
        }
    }

    /// Run one directive and map the exit status to a phase.
    pub fn run(&self, directive: &Directive, arch: ProbeArch) -> Result<Phase, ProbeError> {
        let exe = self.executable(arch);
        tracing::debug!("Launching {arch} probe: {} {:?}", exe.display(), directive.args());
        let mut child = Command::new(exe)
            .args(&self.passthrough)
            .args(directive.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|source| ProbeError::Spawn {
                exe: exe.to_path_buf(),
                source,
            })?;

        let status = child.wait_timeout(self.timeout).map_err(|source| ProbeError::Io {
            path: exe.to_path_buf(),
            source,
        })?;
        let Some(status) = status else {
            tracing::warn!("Probe timed out after {:?}; killing it", self.timeout);
            let _ = child.kill();
            let _ = child.wait();
            return Ok(Phase::Unknown);
        };
        Ok(status.code().map_or(Phase::Unknown, Phase::from_exit_code))
    }

    fn run_logged(&self, directive: &Directive, arch: ProbeArch) -> Phase {
        match self.run(directive, arch) {
            Ok(phase) => {
                tracing::debug!("{arch} probe returned {phase}");
                phase
            }
            Err(e) => {
                tracing::warn!("{e}");
                Phase::Unknown
            }
        }
    }
}

impl ProbeRunner for ProcessProbeRunner {
    fn inspect_host(&self, exe: &Path, workdir: &Path, arch: ProbeArch) -> Phase {
        let directive = Directive::InspectHost {
            exe: exe.to_path_buf(),
            workdir: workdir.to_path_buf(),
        };
        self.run_logged(&directive, arch)
    }

    fn inspect_plugin(&self, plugin: &Path, arch: ProbeArch) -> Phase {
        let directive = Directive::InspectPlugin {
            plugin: plugin.to_path_buf(),
        };
        self.run_logged(&directive, arch)
    }

    fn can_run_64_bit(&self) -> bool {
        engine_is_64_bit() || std::env::var_os("PROCESSOR_ARCHITEW6432").is_some()
    }
}
