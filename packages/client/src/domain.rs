//! Domain logic for client-side operations.
//!
//! Pure functions for parsing input lines and deciding when to exit, kept
//! free of I/O so they are easy to test.

use kizuna_sync::{
    SyncEvent,
    domain::{CanonicalId, LocalId},
};

use crate::error::ClientError;

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Edit { id: CanonicalId, content: String },
    Delete { id: CanonicalId, for_everyone: bool },
    Read(CanonicalId),
    Retry(LocalId),
    React { id: CanonicalId, emoji: String },
    History,
    Who,
    Reconnect,
    Help,
    Quit,
}

/// Parse a trimmed, non-empty input line.
///
/// Lines not starting with `/` are messages. `//text` sends `/text`.
///
/// # Arguments
///
/// * `line` - The input line
///
/// # Returns
///
/// The parsed command, or `ClientError::InvalidCommand` for an unknown
/// command or missing arguments
pub fn parse_command(line: &str) -> Result<Command, ClientError> {
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Send(line.to_string()));
    };
    if rest.starts_with('/') {
        return Ok(Command::Send(rest.to_string()));
    }

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let missing = || ClientError::InvalidCommand(format!("/{} needs more arguments", name));

    match name {
        "edit" => {
            let (id, content) = args.split_once(char::is_whitespace).ok_or_else(missing)?;
            Ok(Command::Edit {
                id: CanonicalId::new(id)?,
                content: content.trim().to_string(),
            })
        }
        "delete" => {
            let mut parts = args.split_whitespace();
            let id = parts.next().ok_or_else(missing)?;
            Ok(Command::Delete {
                id: CanonicalId::new(id)?,
                for_everyone: parts.next() == Some("all"),
            })
        }
        "read" => Ok(Command::Read(CanonicalId::new(args)?)),
        "retry" => Ok(Command::Retry(LocalId::new(args)?)),
        "react" => {
            let (id, emoji) = args.split_once(char::is_whitespace).ok_or_else(missing)?;
            Ok(Command::React {
                id: CanonicalId::new(id)?,
                emoji: emoji.trim().to_string(),
            })
        }
        "history" => Ok(Command::History),
        "who" => Ok(Command::Who),
        "reconnect" => Ok(Command::Reconnect),
        "help" => Ok(Command::Help),
        "quit" | "exit" => Ok(Command::Quit),
        other => Err(ClientError::InvalidCommand(format!("unknown command /{}", other))),
    }
}

/// Events after which the client cannot continue and exits non-zero.
pub fn fatal_error(event: &SyncEvent) -> Option<ClientError> {
    match event {
        SyncEvent::AuthenticationFailed(reason) => {
            Some(ClientError::AuthenticationFailed(reason.clone()))
        }
        SyncEvent::PersistentFailure { attempts } => Some(ClientError::PersistentFailure(*attempts)),
        _ => None,
    }
}
