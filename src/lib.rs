// Public API for integration tests and potential library usage

pub mod connections;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod protocol;
pub mod providers;
pub mod registry;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod ws;
