#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod assignment;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod orchestrator;
pub mod paths;
pub mod restore;
pub mod snapshot;
pub mod wireguard;
