use std::path::PathBuf;

use rhi_schema::{HostDescriptor, InstallUser, Phase};

use crate::reporter::EngineEvent;

/// What the engine knows about the current run.
///
/// Owned by the coordinator and only changed by applying worker events, so
/// a snapshot is always consistent with the reports that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallState {
    pub current_phase: Phase,
    pub temp_folder: Option<PathBuf>,
    pub install_user: InstallUser,
    pub discovered_hosts: Vec<HostDescriptor>,
    pub compatible_host_found: bool,
    /// Set once cleanup has started.
    pub application_exiting: bool,
}

impl InstallState {
    pub fn new(install_user: InstallUser) -> Self {
        Self {
            current_phase: Phase::Start,
            temp_folder: None,
            install_user,
            discovered_hosts: Vec::new(),
            compatible_host_found: false,
            application_exiting: false,
        }
    }

    pub(crate) fn apply(&mut self, event: &EngineEvent) {
        match event {
            EngineEvent::Progress {
                phase: Some(phase), ..
            } => self.current_phase = *phase,
            EngineEvent::Progress { phase: None, .. } => {}
            EngineEvent::TempFolder(folder) => self.temp_folder = Some(folder.clone()),
            EngineEvent::HostDiscovered(host) => self.discovered_hosts.push(host.clone()),
            EngineEvent::CompatibleHostFound => self.compatible_host_found = true,
        }
    }
}

impl Default for InstallState {
    fn default() -> Self {
        Self::new(InstallUser::CurrentUser)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::Level;

    #[test]
    fn test_apply_tracks_phase_and_hosts() {
        let mut state = InstallState::default();
        assert_eq!(state.current_phase, Phase::Start);

        state.apply(&EngineEvent::Progress {
            level: Level::Info,
            phase: Some(Phase::Initializing),
            message: String::new(),
        });
        state.apply(&EngineEvent::Progress {
            level: Level::Debug,
            phase: None,
            message: "noise".into(),
        });
        state.apply(&EngineEvent::TempFolder(PathBuf::from("/t/1")));
        state.apply(&EngineEvent::HostDiscovered(HostDescriptor::default()));
        state.apply(&EngineEvent::CompatibleHostFound);

        assert_eq!(state.current_phase, Phase::Initializing);
        assert_eq!(state.temp_folder.as_deref(), Some(std::path::Path::new("/t/1")));
        assert_eq!(state.discovered_hosts.len(), 1);
        assert!(state.compatible_host_found);
        assert!(!state.application_exiting);
    }
}
