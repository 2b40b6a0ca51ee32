//! Terminal chat client for kizuna.

pub mod domain;
pub mod error;
pub mod formatter;
mod runner;
mod ui;

pub use runner::{ClientOptions, run_client};
