//! Testscope CLI
//!
//! Terminal client for the Testscope daemon: starts runs, follows their
//! events and reports the results.

pub mod client;
pub mod driver;
pub mod output;

pub use client::{DaemonClient, RelaySocket};
pub use driver::{DriverOptions, RunDriver};
