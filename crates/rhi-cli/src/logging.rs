//! Tracing setup.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::GlobalArgs;

/// Map an installer log level onto a filter directive.
pub fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" => "error",
        "warning" | "warn" => "warn",
        "info" => "info",
        "trace" => "trace",
        _ => "debug",
    }
}

fn filter(global: &GlobalArgs) -> EnvFilter {
    match &global.log_level {
        Some(level) => EnvFilter::new(level_directive(level)),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    }
}

/// Install the global subscriber: stderr by default, or an appended file
/// without colors when `--log-file` is given.
pub fn init(global: &GlobalArgs) -> Result<()> {
    let filter = filter(global);
    match &global.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log folder {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_installer_levels() {
        assert_eq!(level_directive("Warning"), "warn");
        assert_eq!(level_directive("ERROR"), "error");
        assert_eq!(level_directive("verbose"), "debug");
    }
}
