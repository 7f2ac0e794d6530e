//! Reporter trait and the worker-to-coordinator event channel.
//!
//! Worker tasks never touch engine state. They push [`EngineEvent`]s through
//! an [`EventSink`]; the engine drains them in order, applies them to its
//! state and forwards messages to a [`Reporter`], which lets a console, a
//! wizard or a test observe an install without being coupled to the engine.

use std::path::PathBuf;

use rhi_schema::{HostDescriptor, Phase};
use tokio::sync::mpsc;

/// Severity of a progress message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
}

/// One report from a worker task.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A log line, optionally moving the engine to a new phase.
    Progress {
        level: Level,
        phase: Option<Phase>,
        message: String,
    },
    /// The per-run temp folder was created.
    TempFolder(PathBuf),
    /// A valid host was read back from a probe.
    HostDiscovered(HostDescriptor),
    /// The selected handler accepts at least one discovered host.
    CompatibleHostFound,
}

/// Sending half of the event channel, handed to every worker step.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    /// Create a sink and the receiver the coordinator drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("event receiver dropped; report discarded");
        }
    }

    /// Report a phase transition.
    pub fn phase(&self, level: Level, phase: Phase, message: impl Into<String>) {
        self.send(EngineEvent::Progress {
            level,
            phase: Some(phase),
            message: message.into(),
        });
    }

    pub fn message(&self, level: Level, message: impl Into<String>) {
        self.send(EngineEvent::Progress {
            level,
            phase: None,
            message: message.into(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.message(Level::Debug, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.message(Level::Info, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.message(Level::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.message(Level::Error, message);
    }
}

/// Observer of engine progress.
pub trait Reporter: Send + Sync {
    /// The engine entered `phase`.
    fn phase_changed(&self, phase: Phase, message: &str);

    /// Log an informational message.
    fn info(&self, msg: &str);

    /// Log a warning message.
    fn warning(&self, msg: &str);

    /// Log an error message.
    fn error(&self, msg: &str);

    /// A host installation was discovered.
    fn host_discovered(&self, host: &HostDescriptor);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn phase_changed(&self, phase: Phase, message: &str) {
        (**self).phase_changed(phase, message)
    }
    fn info(&self, msg: &str) {
        (**self).info(msg)
    }
    fn warning(&self, msg: &str) {
        (**self).warning(msg)
    }
    fn error(&self, msg: &str) {
        (**self).error(msg)
    }
    fn host_discovered(&self, host: &HostDescriptor) {
        (**self).host_discovered(host)
    }
}

/// A no-op reporter for silent runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn phase_changed(&self, _: Phase, _: &str) {}
    fn info(&self, _: &str) {}
    fn warning(&self, _: &str) {}
    fn error(&self, _: &str) {}
    fn host_discovered(&self, _: &HostDescriptor) {}
}
