pub mod actions;
pub mod approval;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gateway_client;
pub mod ledger;
pub mod lifecycle;
pub mod network;
pub mod notifications;
pub mod orchestrator;
pub mod polling;
pub mod reconcile;
pub mod recovery;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use orchestrator::GameOrchestrator;
