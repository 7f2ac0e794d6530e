//! Install one package.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rhi_core::{
    Collaborators, Engine, EngineConfig, HandlerSet, NullReporter, ProcessProbeRunner, Reporter,
};
use rhi_schema::{InstallUser, Phase};

use crate::GlobalArgs;
use crate::console::ConsoleReporter;

/// Run the engine for `package` and return its final phase.
///
/// Ctrl-C cancels at the next step boundary.
pub async fn install(package: &Path, global: &GlobalArgs, config: EngineConfig) -> Result<Phase> {
    let store = config
        .open_store()
        .context("opening configuration store")?;
    let probe = ProcessProbeRunner::from_config(&config.probe)?.with_passthrough(global.passthrough());
    let reporter: Arc<dyn Reporter> = if global.silent {
        Arc::new(NullReporter)
    } else {
        Arc::new(ConsoleReporter)
    };
    let user = if global.all_users {
        InstallUser::AllUsers
    } else {
        InstallUser::CurrentUser
    };

    let mut engine = Engine::new(
        Arc::new(config),
        Collaborators {
            store,
            probe: Arc::new(probe),
            handlers: HandlerSet::standard(),
            reporter,
        },
    )
    .with_install_user(user);

    let token = engine.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted; stopping after the current step");
            token.cancel();
        }
    });

    let phase = engine.run(package).await;
    interrupt.abort();
    Ok(phase)
}
