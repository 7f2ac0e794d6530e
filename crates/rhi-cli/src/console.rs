//! Console progress output.

use rhi_core::Reporter;
use rhi_schema::{HostDescriptor, Phase};

/// Prints phase changes and messages to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleReporter;

impl Reporter for ConsoleReporter {
    fn phase_changed(&self, phase: Phase, message: &str) {
        match phase {
            Phase::Cleanup => {}
            _ if phase.is_failure() => eprintln!("error: {message}"),
            _ => eprintln!("{message}"),
        }
    }

    fn info(&self, msg: &str) {
        eprintln!("{msg}");
    }

    fn warning(&self, msg: &str) {
        eprintln!("warning: {msg}");
    }

    fn error(&self, msg: &str) {
        eprintln!("error: {msg}");
    }

    fn host_discovered(&self, host: &HostDescriptor) {
        eprintln!(
            "Found Rhino {} {} ({})",
            host.version, host.edition, host.os
        );
    }
}
