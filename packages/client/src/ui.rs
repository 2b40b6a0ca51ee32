//! UI utilities for the client.

use std::io::Write;

use kizuna_sync::domain::SubjectId;

/// Redisplay the prompt after printing an event
pub fn redisplay_prompt(subject: &SubjectId) {
    print!("{}> ", subject);
    std::io::stdout().flush().ok();
}

/// Print a formatted block and restore the prompt below it
pub fn show(output: &str, subject: &SubjectId) {
    print!("{}", output);
    redisplay_prompt(subject);
}
