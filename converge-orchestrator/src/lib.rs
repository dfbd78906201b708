pub mod change_set;
pub mod error;
pub mod lifecycle_guard;
pub mod logger;
pub mod provider_manager;
pub mod reconciler;
pub mod retry;
pub mod settings;
pub mod state_machine;

pub use change_set::{ChangeKind, ChangeSet};
pub use error::{Phase, ReconcileError};
pub use lifecycle_guard::{Rule, Violation};
pub use reconciler::{ReconcileConfig, Reconciler};
