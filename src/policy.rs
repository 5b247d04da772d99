//! Authorization policies gating MQTT- and MCU-originated actions.
//!
//! Two layers:
//!
//! * [`AllowedCommandPolicy`] — allow-list of executable names (glob
//!   patterns, `*` allows everything) consulted before any subprocess spawn.
//! * [`TopicAuthorization`] — static per-(topic, action) allow table
//!   consulted before every MQTT-originated side effect.
//!
//! Inbound command strings are tokenized with POSIX-like shell-word
//! splitting. Metacharacters such as `;` and `&` are NOT rejected: commands
//! are spawned via `execve` without a shell, so those characters are literal
//! arguments and harmless.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::topics::Topic;

/// Wildcard entry allowing every command.
pub const ALLOWED_COMMAND_WILDCARD: &str = "*";

/// Raised when an inbound command string is unsafe or malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandValidationError {
    #[error("empty command")]
    Empty,
    #[error("malformed command syntax: {0}")]
    Malformed(String),
    #[error("command '{0}' not allowed")]
    NotAllowed(String),
}

/// Split a command string into shell words, respecting quotes.
///
/// Supports single quotes (no escapes inside), double quotes (backslash
/// escapes `\"` and `\\`) and bare backslash escapes. No variable or glob
/// expansion is performed.
pub fn tokenize_shell_command(command: &str) -> Result<Vec<String>, CommandValidationError> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(CommandValidationError::Empty);
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut chars = trimmed.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            c if c.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            '\'' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(CommandValidationError::Malformed(
                                "unterminated single quote".into(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => {
                                return Err(CommandValidationError::Malformed(
                                    "dangling escape in double quote".into(),
                                ))
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(CommandValidationError::Malformed(
                                "unterminated double quote".into(),
                            ))
                        }
                    }
                }
            }
            '\\' => {
                in_token = true;
                match chars.next() {
                    Some(escaped) => current.push(escaped),
                    None => {
                        return Err(CommandValidationError::Malformed("dangling escape".into()))
                    }
                }
            }
            c => {
                in_token = true;
                current.push(c);
            }
        }
    }

    if in_token {
        tokens.push(current);
    }

    if tokens.is_empty() {
        return Err(CommandValidationError::Empty);
    }
    Ok(tokens)
}

/// Normalised allow-list for shell/process commands.
#[derive(Debug)]
pub struct AllowedCommandPolicy {
    entries: Vec<String>,
    allow_all: bool,
    matchers: GlobSet,
}

impl Default for AllowedCommandPolicy {
    fn default() -> Self {
        Self::from_entries::<&str>(&[])
    }
}

impl AllowedCommandPolicy {
    /// Build a policy from raw entries: deduplicated, lower-cased, wildcard
    /// collapsing to allow-all.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut seen = std::collections::HashSet::new();
        let mut normalised = Vec::new();
        let mut allow_all = false;
        for entry in entries {
            let candidate = entry.as_ref().trim().to_lowercase();
            if candidate.is_empty() {
                continue;
            }
            if candidate == ALLOWED_COMMAND_WILDCARD {
                allow_all = true;
                normalised = vec![ALLOWED_COMMAND_WILDCARD.to_string()];
                break;
            }
            if seen.insert(candidate.clone()) {
                normalised.push(candidate);
            }
        }

        let mut builder = GlobSetBuilder::new();
        if !allow_all {
            for pattern in &normalised {
                if let Ok(glob) = Glob::new(pattern) {
                    builder.add(glob);
                } else {
                    log::warn!("Ignoring invalid allowed-command pattern '{pattern}'");
                }
            }
        }
        let matchers = builder.build().unwrap_or_else(|_| GlobSet::empty());

        Self { entries: normalised, allow_all, matchers }
    }

    /// True when every command is allowed.
    pub fn allow_all(&self) -> bool {
        self.allow_all
    }

    /// Check the executable name of `command` against the allow-list.
    pub fn is_allowed(&self, command: &str) -> bool {
        let Some(first) = command.split_whitespace().next() else {
            return false;
        };
        if self.allow_all {
            return true;
        }
        self.matchers.is_match(first.to_lowercase())
    }

    /// The normalised entries.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }
}

/// Per-topic allow flags for MQTT-driven actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicAuthorization {
    pub file_read: bool,
    pub file_write: bool,
    pub file_remove: bool,
    pub datastore_get: bool,
    pub datastore_put: bool,
    pub mailbox_read: bool,
    pub mailbox_write: bool,
    pub shell_run: bool,
    pub shell_run_async: bool,
    pub shell_poll: bool,
    pub shell_kill: bool,
    pub console_input: bool,
    pub digital_write: bool,
    pub digital_read: bool,
    pub digital_mode: bool,
    pub analog_write: bool,
    pub analog_read: bool,
}

impl Default for TopicAuthorization {
    fn default() -> Self {
        Self {
            file_read: true,
            file_write: true,
            file_remove: true,
            datastore_get: true,
            datastore_put: true,
            mailbox_read: true,
            mailbox_write: true,
            shell_run: true,
            shell_run_async: true,
            shell_poll: true,
            shell_kill: true,
            console_input: true,
            digital_write: true,
            digital_read: true,
            digital_mode: true,
            analog_write: true,
            analog_read: true,
        }
    }
}

impl TopicAuthorization {
    /// Check whether `action` is allowed on `topic`.
    ///
    /// Unknown (topic, action) pairs are denied.
    pub fn allows(&self, topic: Topic, action: &str) -> bool {
        match (topic, action.to_lowercase().as_str()) {
            (Topic::File, "read") => self.file_read,
            (Topic::File, "write") => self.file_write,
            (Topic::File, "remove") => self.file_remove,
            (Topic::Datastore, "get") => self.datastore_get,
            (Topic::Datastore, "put") => self.datastore_put,
            (Topic::Mailbox, "read") => self.mailbox_read,
            (Topic::Mailbox, "write") => self.mailbox_write,
            (Topic::Shell, "run") => self.shell_run,
            (Topic::Shell, "run_async") => self.shell_run_async,
            (Topic::Shell, "poll") => self.shell_poll,
            (Topic::Shell, "kill") => self.shell_kill,
            (Topic::Console, "in" | "input") => self.console_input,
            (Topic::Digital, "write") => self.digital_write,
            (Topic::Digital, "read") => self.digital_read,
            (Topic::Digital, "mode") => self.digital_mode,
            (Topic::Analog, "write") => self.analog_write,
            (Topic::Analog, "read") => self.analog_read,
            _ => false,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
