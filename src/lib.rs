//! render_probe: headless render verification harness.
//!
//! Launches a browser, loads a page, waits for an application-defined ready
//! signal (a DOM selector or console markers), and judges the run PASS, FAIL
//! or ERROR with a screenshot and console transcript as artifacts.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod browser;
pub mod cli;
pub mod config;
pub mod error;
pub mod logs;
pub mod matcher;
pub mod recorder;
pub mod runner;
pub mod utils;
pub mod verdict;
pub mod waiter;

pub use config::{SessionConfig, SessionSpec};
pub use runner::SessionRunner;
pub use verdict::{Outcome, Verdict};
