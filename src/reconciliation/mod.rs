pub mod batch;
pub mod orchestrator;
pub mod window;

pub use orchestrator::{CancellationFlag, Reconciler, RunOptions};
pub use window::{compute_window, ReconciliationWindow};
