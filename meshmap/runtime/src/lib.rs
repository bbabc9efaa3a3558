#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! CLI surface and run orchestration: argument parsing, tracing setup,
//! registry population, and the `spider` / `render` commands.

mod args;

pub use self::args::Args;

/// Snapshot of the most recent crawl, inside the outputs directory.
pub const LASTRUN_FILE: &str = ".lastrun.json";
