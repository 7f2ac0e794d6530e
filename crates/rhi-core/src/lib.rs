pub mod archive;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod layout;
pub mod probe;
pub mod reporter;
pub mod store;
pub mod transaction;

pub use archive::{ArchiveError, FileEntry, Package};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Collaborators, Engine, EngineError, InstallState};
pub use handlers::{ContentHandler, Handler, HandlerContext, HandlerError, HandlerSet};
pub use layout::Layout;
pub use probe::{Directive, ProbeArch, ProbeError, ProbeRunner, ProcessProbeRunner};
pub use reporter::{EngineEvent, EventSink, Level, NullReporter, Reporter};
pub use store::{ConfigStore, Hive, JsonStore, StoreError};
#[cfg(windows)]
pub use store::RegistryStore;
pub use transaction::{InstallError, Transaction, install};

/// Name of the executable the engine re-invokes for probes and bundled installs.
pub const EXECUTABLE_NAME: &str = "rhiexec";
