//! Boundary contracts between the engine and its collaborators.

pub mod executor;
pub mod notifier;
pub mod store;

pub use executor::{CommandBackend, CommandReport, RequestBackend, RequestReport};
pub use notifier::Notifier;
pub use store::TaskStore;
