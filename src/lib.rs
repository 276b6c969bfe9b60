//! A small interactive shell with pipelines and background jobs.
//!
//! Lines are split on whitespace, `$NAME` references are expanded from the
//! session's variables, and the result is dispatched: builtins (see the
//! `builtin` module) run in-process, anything else is forked and exec'd.
//! `a | b | c` runs one process per stage connected by pipes, and a
//! trailing `&` runs the line in the background, tracked in a bounded job
//! table and announced when it finishes.
//!
//! The main entry point is [`Interpreter`]. The public modules [`command`]
//! and [`env`] expose the traits and session state builtins work with.

mod builtin;
pub mod command;
pub mod config;
pub mod env;
pub mod error;
mod expand;
mod external;
pub mod jobs;
mod interpreter;
mod lexer;
mod listing;
mod pipeline;
mod reaper;
mod relay;
mod supervisor;

pub use config::ShellConfig;
pub use interpreter::Interpreter;
