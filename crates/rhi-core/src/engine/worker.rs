//! The blocking halves of initialize and install.
//!
//! A [`Worker`] owns handles to every collaborator plus the sending side of
//! the event channel. It never touches engine state; every outcome,
//! including the terminal phase, is reported as an event.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rhi_schema::{HostDescriptor, InstallUser, Phase};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::{ArchiveError, Package};
use crate::config::EngineConfig;
use crate::handlers::{ContentHandler, Handler, HandlerContext, HandlerSet, installed_versions};
use crate::probe::discovery::remove_probe_files;
use crate::probe::{ProbeRunner, discover_hosts, engine_is_64_bit, registry_candidates};
use crate::reporter::{EngineEvent, EventSink, Level};
use crate::store::ConfigStore;
use crate::transaction;

/// A recognized, initialized package waiting to be installed.
#[derive(Debug)]
pub(crate) struct Prepared {
    pub package: Package,
    pub handler: Handler,
}

pub(crate) struct Worker {
    pub config: Arc<EngineConfig>,
    pub store: Arc<dyn ConfigStore>,
    pub probe: Arc<dyn ProbeRunner>,
    pub token: CancellationToken,
    pub events: EventSink,
}

/// Remove a folder tree; a folder that is already gone is not an error.
pub(crate) fn remove_tree(path: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

impl Worker {
    fn cx(&self) -> HandlerContext<'_> {
        HandlerContext {
            layout: &self.config.layout,
            store: self.store.as_ref(),
            probe: self.probe.as_ref(),
            events: &self.events,
        }
    }

    fn fail(&self, phase: Phase, message: impl Into<String>) {
        self.events.phase(Level::Error, phase, message);
    }

    /// Report `Canceled` if cancellation was requested since the last step.
    fn canceled(&self) -> bool {
        if self.token.is_cancelled() {
            self.events.phase(Level::Info, Phase::Canceled, "Canceled");
            return true;
        }
        false
    }

    /// Wipe the temp root and create this run's folder under it.
    fn prepare_temp(&self) -> io::Result<PathBuf> {
        let root = self.config.temp_root();
        if let Err(e) = remove_tree(&root) {
            self.events
                .warn(format!("Could not delete temp folder {}: {e}", root.display()));
        }
        let folder = root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&folder)?;
        self.events.send(EngineEvent::TempFolder(folder.clone()));
        Ok(folder)
    }

    /// Inspect the package and discover hosts. Returns the package and its
    /// handler only when the run reached `Initialized`.
    pub fn initialize(
        &self,
        package_path: &Path,
        handlers: HandlerSet,
        user: InstallUser,
    ) -> Option<Prepared> {
        self.events.phase(
            Level::Info,
            Phase::Initializing,
            format!("Initializing {}", package_path.display()),
        );

        let temp = match self.prepare_temp() {
            Ok(temp) => temp,
            Err(e) => {
                self.fail(Phase::InitializationFailed, format!("Cannot create temp folder: {e}"));
                return None;
            }
        };
        if self.canceled() {
            return None;
        }

        let mut package = match Package::open(package_path) {
            Ok(package) => package,
            Err(ArchiveError::NotFound(path)) => {
                self.fail(
                    Phase::PackageNotFound,
                    format!("Package not found: {}", path.display()),
                );
                return None;
            }
            Err(e) => {
                self.fail(Phase::InitializationFailed, format!("Cannot open package: {e}"));
                return None;
            }
        };
        if let Err(e) = package.set_destination(&temp) {
            self.fail(Phase::InitializationFailed, e.to_string());
            return None;
        }
        if self.canceled() {
            return None;
        }

        let cx = self.cx();
        let Some(mut handler) = handlers.select(&mut package, &cx) else {
            self.fail(
                Phase::InitializationFailed,
                format!("No handler recognizes {}", package_path.display()),
            );
            return None;
        };
        if self.canceled() {
            return None;
        }

        if let Err(e) = handler.initialize(&mut package, &cx) {
            self.fail(Phase::InitializationFailed, format!("Package initialization failed: {e}"));
            return None;
        }
        self.events.info(handler.describe());
        if self.canceled() {
            return None;
        }

        match handler.install_state(&cx, user) {
            Ok(state) if state.is_installed_or_newer() => {
                self.events.phase(
                    Level::Info,
                    Phase::AlreadyInstalled,
                    format!("Already installed ({state:?})"),
                );
                return None;
            }
            Ok(state) => self.events.debug(format!("Install state: {state:?}")),
            Err(e) => {
                self.fail(Phase::InitializationFailed, format!("Cannot read install state: {e}"));
                return None;
            }
        }
        if self.canceled() {
            return None;
        }

        let candidates = registry_candidates(self.store.as_ref(), engine_is_64_bit());
        let hosts = discover_hosts(
            &candidates,
            self.probe.as_ref(),
            &temp,
            &self.token,
            &self.events,
        );
        if self.canceled() {
            return None;
        }

        let mut compatible = false;
        for host in hosts {
            compatible |= handler.is_compatible(&host);
            self.events.send(EngineEvent::HostDiscovered(host));
        }
        if !compatible {
            self.fail(
                Phase::NotCompatible,
                "This package is not compatible with any installed host",
            );
            return None;
        }
        self.events.send(EngineEvent::CompatibleHostFound);
        self.events
            .phase(Level::Info, Phase::Initialized, "Ready to install");
        Some(Prepared { package, handler })
    }

    /// Copy the package into place and register it with `hosts`.
    pub fn install(&self, prepared: &mut Prepared, hosts: &[HostDescriptor], user: InstallUser) {
        let Prepared { package, handler } = prepared;
        self.events
            .phase(Level::Info, Phase::Installing, handler.describe());

        let cx = self.cx();
        let root = self.config.layout.root_for(handler.install_root(), user);
        let destination = match handler.install_folder(root) {
            Ok(destination) => destination,
            Err(e) => {
                self.fail(Phase::InstallFailed, format!("Cannot resolve install folder: {e}"));
                return;
            }
        };
        if let Some(parent) = destination.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                self.fail(
                    Phase::InstallFailed,
                    format!("Cannot create {}: {e}", parent.display()),
                );
                return;
            }
        }
        if self.canceled() {
            return;
        }

        if !handler.before_install(&destination, hosts, user, &cx) {
            self.fail(Phase::InstallFailed, "Pre-install step failed");
            return;
        }
        if self.canceled() {
            return;
        }

        let fresh = !destination.exists();
        match transaction::install(package, &destination, &*handler, &self.events) {
            Ok(record) => self.events.info(format!(
                "Installed {} files to {}",
                record.installed_files.len(),
                destination.display()
            )),
            Err(e) => {
                self.fail(Phase::InstallFailed, e.to_string());
                return;
            }
        }

        // Committed files are always registered, even when canceled.
        self.events
            .phase(Level::Info, Phase::Registering, "Registering");
        if !handler.after_install(package, &destination, hosts, user, &cx) {
            if fresh {
                if let Err(e) = remove_tree(&destination) {
                    self.events.warn(format!(
                        "Could not delete {}: {e}",
                        destination.display()
                    ));
                }
            }
            self.remove_temp_root();
            self.fail(Phase::InstallFailed, "Post-install step failed");
            return;
        }

        self.prune(&destination);
        self.events
            .phase(Level::Info, Phase::Complete, "Installation complete");
    }

    /// Delete probe leftovers and versions beyond `keep_versions`, then the
    /// temp root.
    fn prune(&self, destination: &Path) {
        remove_probe_files(destination);

        if let Some(parent) = destination.parent() {
            let versions = installed_versions(parent);
            let excess = versions
                .len()
                .saturating_sub(self.config.keep_versions + 1);
            for (version, folder) in versions.into_iter().take(excess) {
                match remove_tree(&folder) {
                    Ok(()) => self.events.info(format!("Removed old version {version}")),
                    Err(e) => self
                        .events
                        .warn(format!("Could not remove {}: {e}", folder.display())),
                }
            }
        }

        self.remove_temp_root();
    }

    fn remove_temp_root(&self) {
        let root = self.config.temp_root();
        if let Err(e) = remove_tree(&root) {
            self.events
                .debug(format!("Could not delete temp folder {}: {e}", root.display()));
        }
    }
}
