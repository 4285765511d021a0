pub mod config;
pub mod dialect;
pub mod error_handling;
pub mod execution;
pub mod extraction;
pub mod frontend;
pub mod inference;
pub mod logging;
pub mod prompt;
pub mod session;
