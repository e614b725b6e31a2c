pub mod manager;
pub mod runtime;

pub use manager::{DuelCoordinator, ProposeOutcome};
pub use runtime::DuelRuntime;
