//! Utilities shared by the kizuna packages: logging setup and clocks.

pub mod logger;
pub mod time;
