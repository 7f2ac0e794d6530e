//! Install orchestration.
//!
//! [`Engine`] drives one package through two steps: `initialize` inspects
//! the package and discovers hosts, `install` copies and registers it. Each
//! step runs on a blocking worker that reports through an
//! [`EventSink`](crate::reporter::EventSink). The engine drains those events
//! in order, applies them to its [`InstallState`] and forwards them to the
//! [`Reporter`], so state is only ever written from one place.
//!
//! Cancellation is cooperative. Workers check the token between steps, never
//! in the middle of a file copy, and a canceled install is not rolled back.
//! Once the copy has committed, the install runs on through registration.

mod state;
mod worker;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rhi_schema::{InstallUser, Phase};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::handlers::HandlerSet;
use crate::probe::ProbeRunner;
use crate::reporter::{EngineEvent, EventSink, Level, Reporter};
use crate::store::ConfigStore;

pub use state::InstallState;
use worker::{Prepared, Worker, remove_tree};

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("Cannot {operation} in phase {phase}")]
    Contract {
        operation: &'static str,
        phase: Phase,
    },

    #[error("Worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{context}: {message}")]
    Context {
        context: &'static str,
        message: String,
    },
}

impl EngineError {
    /// Create an error with context for better debugging.
    pub fn context(ctx: &'static str, msg: impl fmt::Display) -> Self {
        Self::Context {
            context: ctx,
            message: msg.to_string(),
        }
    }
}

/// Everything the engine talks to besides the file system.
pub struct Collaborators {
    pub store: Arc<dyn ConfigStore>,
    pub probe: Arc<dyn ProbeRunner>,
    pub handlers: HandlerSet,
    pub reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collaborators")
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

/// One install run.
pub struct Engine {
    config: Arc<EngineConfig>,
    store: Arc<dyn ConfigStore>,
    probe: Arc<dyn ProbeRunner>,
    reporter: Arc<dyn Reporter>,
    handlers: Option<HandlerSet>,
    state: InstallState,
    prepared: Option<Prepared>,
    token: CancellationToken,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("state", &self.state)
            .field("prepared", &self.prepared)
            .finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(config: Arc<EngineConfig>, collaborators: Collaborators) -> Self {
        let Collaborators {
            store,
            probe,
            handlers,
            reporter,
        } = collaborators;
        Self {
            config,
            store,
            probe,
            reporter,
            handlers: Some(handlers),
            state: InstallState::default(),
            prepared: None,
            token: CancellationToken::new(),
        }
    }

    /// Install for every user instead of the current one.
    pub fn with_install_user(mut self, user: InstallUser) -> Self {
        self.state.install_user = user;
        self
    }

    pub fn state(&self) -> &InstallState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.current_phase
    }

    /// Token a running step polls. Cancel it from another task to stop the
    /// step at its next boundary.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn worker(&self, events: EventSink) -> Worker {
        Worker {
            config: Arc::clone(&self.config),
            store: Arc::clone(&self.store),
            probe: Arc::clone(&self.probe),
            token: self.token.clone(),
            events,
        }
    }

    fn require(&self, expected: Phase, operation: &'static str) -> Result<(), EngineError> {
        if self.state.current_phase == expected {
            Ok(())
        } else {
            Err(EngineError::Contract {
                operation,
                phase: self.state.current_phase,
            })
        }
    }

    /// Inspect the package and discover compatible hosts.
    ///
    /// Only valid from `Start`. Returns the phase the engine ended in:
    /// `Initialized` when an install may follow, otherwise a terminal phase.
    pub async fn initialize(&mut self, package_path: &Path) -> Result<Phase, EngineError> {
        self.require(Phase::Start, "initialize")?;
        let handlers = self
            .handlers
            .take()
            .ok_or_else(|| EngineError::context("initialize", "handlers already consumed"))?;

        let (events, rx) = EventSink::channel();
        let worker = self.worker(events);
        let path = package_path.to_path_buf();
        let user = self.state.install_user;
        let task = tokio::task::spawn_blocking(move || worker.initialize(&path, handlers, user));

        self.prepared = self.drive(rx, task).await?;
        Ok(self.state.current_phase)
    }

    /// Copy the package into place and register it.
    ///
    /// Only valid from `Initialized`.
    pub async fn install(&mut self) -> Result<Phase, EngineError> {
        self.require(Phase::Initialized, "install")?;
        let mut prepared = self
            .prepared
            .take()
            .ok_or_else(|| EngineError::context("install", "no initialized package"))?;

        let (events, rx) = EventSink::channel();
        let worker = self.worker(events);
        let hosts = self.state.discovered_hosts.clone();
        let user = self.state.install_user;
        let task = tokio::task::spawn_blocking(move || {
            worker.install(&mut prepared, &hosts, user);
            prepared
        });

        self.prepared = Some(self.drive(rx, task).await?);
        Ok(self.state.current_phase)
    }

    /// Forward events until the worker drops its sink, then collect its
    /// result.
    async fn drive<T>(
        &mut self,
        mut rx: UnboundedReceiver<EngineEvent>,
        task: JoinHandle<T>,
    ) -> Result<T, EngineError> {
        while let Some(event) = rx.recv().await {
            self.dispatch(event);
        }
        match task.await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.set_phase(Level::Error, Phase::Exception, &format!("Worker task failed: {e}"));
                Err(e.into())
            }
        }
    }

    fn dispatch(&mut self, event: EngineEvent) {
        match &event {
            EngineEvent::Progress {
                level,
                phase,
                message,
            } => {
                log(*level, message);
                match (phase, level) {
                    (Some(phase), _) => self.reporter.phase_changed(*phase, message),
                    (None, Level::Debug) => {}
                    (None, Level::Info) => self.reporter.info(message),
                    (None, Level::Warning) => self.reporter.warning(message),
                    (None, Level::Error) => self.reporter.error(message),
                }
            }
            EngineEvent::TempFolder(folder) => {
                tracing::debug!("Temp folder: {}", folder.display());
            }
            EngineEvent::HostDiscovered(host) => {
                tracing::info!(
                    "Host {} {} ({}) at {}",
                    host.version,
                    host.edition,
                    host.os,
                    host.exe_path.display()
                );
                self.reporter.host_discovered(host);
            }
            EngineEvent::CompatibleHostFound => tracing::debug!("Compatible host found"),
        }
        self.state.apply(&event);
    }

    fn set_phase(&mut self, level: Level, phase: Phase, message: &str) {
        self.dispatch(EngineEvent::Progress {
            level,
            phase: Some(phase),
            message: message.to_string(),
        });
    }

    /// Stop the run.
    ///
    /// Cancels the token and, since no step can be running while the engine
    /// is borrowed here, cleans up straight away.
    pub fn cancel(&mut self) {
        self.token.cancel();
        if !self.state.current_phase.is_terminal() {
            self.set_phase(Level::Info, Phase::Canceled, "Canceled");
        }
        self.cleanup();
    }

    /// Release the package and delete the temp root. Runs at most once.
    ///
    /// A run stopped before reaching a terminal phase ends as `Canceled`.
    pub fn cleanup(&mut self) {
        if self.state.application_exiting {
            return;
        }
        self.state.application_exiting = true;

        let mut final_phase = self.state.current_phase;
        if !final_phase.is_terminal() {
            final_phase = Phase::Canceled;
        }
        self.set_phase(Level::Debug, Phase::Cleanup, "Cleaning up");
        self.prepared = None;

        let root = self.config.temp_root();
        if let Err(e) = remove_tree(&root) {
            tracing::warn!("Could not delete temp folder {}: {e}", root.display());
        }
        self.set_phase(Level::Info, final_phase, &format!("Finished: {final_phase}"));
    }

    /// Initialize, install when possible, clean up and return the final
    /// phase.
    pub async fn run(&mut self, package_path: &Path) -> Phase {
        let result = match self.initialize(package_path).await {
            Ok(Phase::Initialized) => self.install().await,
            other => other,
        };
        if let Err(e) = result {
            tracing::error!("{e}");
            if !self.state.current_phase.is_terminal() {
                self.set_phase(Level::Error, Phase::Exception, &e.to_string());
            }
        }
        self.cleanup();
        self.state.current_phase
    }
}

fn log(level: Level, message: &str) {
    match level {
        Level::Debug => tracing::debug!("{message}"),
        Level::Info => tracing::info!("{message}"),
        Level::Warning => tracing::warn!("{message}"),
        Level::Error => tracing::error!("{message}"),
    }
}
