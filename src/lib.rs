pub mod agent;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod operation;
pub mod queue;
pub mod schedule;
pub mod shutdown;
pub mod status;
pub mod store;
pub mod watchdog;
