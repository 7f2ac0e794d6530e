//! Probe child entry points.

use std::path::Path;

use rhi_core::probe::inspect;
use rhi_schema::Phase;

/// Inspect a host executable; the descriptor lands in `workdir`.
pub fn host(exe: &Path, workdir: &Path) -> Phase {
    tracing::info!("Inspecting host {}", exe.display());
    inspect::inspect_host(exe, workdir)
}

/// Inspect a plug-in; the descriptor lands beside it.
pub fn plugin(plugin: &Path) -> Phase {
    tracing::info!("Inspecting plug-in {}", plugin.display());
    inspect::inspect_plugin(plugin)
}
