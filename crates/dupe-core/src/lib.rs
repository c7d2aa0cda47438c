//! Core of dupe-rs: launches `asr`/`hdiutil`/`diskutil` with administrator
//! rights, streams their output line by line, parses progress, and sequences
//! dependent commands into observable, cancellable operations.
//!
//! Presentation lives in `dupe-cli`; everything here communicates through
//! [`events::Event`] values sent over a tokio channel.

pub mod command;
pub mod config;
pub mod elevation;
pub mod error;
pub mod events;
pub mod inventory;
pub mod operation;
pub mod orchestrator;
pub mod progress;
pub mod reader;
pub mod runner;
