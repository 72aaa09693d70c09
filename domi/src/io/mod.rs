//! Side-effecting code: configuration, stores and child processes.

pub mod checkpoint_store;
pub mod command_agent;
pub mod config;
pub mod files;
pub mod init;
pub mod micro_store;
pub mod process;
