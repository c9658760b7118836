//! ArchDash core library: command classification, policy table, execution sandbox,
//! gatekeeper and gateway, used by both the CLI and desktop applications.

pub mod command;
pub mod config;
pub mod exec;
pub mod gatekeeper;
pub mod gateway;
pub mod init;
pub mod policy;
pub mod session;
