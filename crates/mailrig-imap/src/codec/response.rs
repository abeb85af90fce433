//! Response structure and post-processing.

use std::collections::BTreeMap;
use std::fmt;

use super::value::Value;

/// Commands whose responses carry an optional `[CODE ...]` and human text.
const STATUS_COMMANDS: [&str; 5] = ["OK", "NO", "BAD", "BYE", "PREAUTH"];

/// Returns `true` for `OK`/`NO`/`BAD`/`BYE`/`PREAUTH` (case-insensitive).
#[must_use]
pub fn is_status_command(command: &str) -> bool {
    STATUS_COMMANDS
        .iter()
        .any(|status| command.eq_ignore_ascii_case(status))
}

/// A machine-readable response code, the bracketed `[CODE ...]` of a status
/// response. `name` is uppercased; `args` holds the remaining section
/// entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCode {
    /// Uppercased code name, e.g. `ALERT` or `CAPABILITY`.
    pub name: String,
    /// Remaining section entries after the name.
    pub args: Vec<CodeArg>,
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// One argument of a [`ResponseCode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeArg {
    /// A single entry, uppercased and trimmed (`[CAPABILITY IMAP4rev1]`).
    Value(String),
    /// A parenthesized entry, each element trimmed
    /// (`[PERMANENTFLAGS (\Seen \*)]`).
    List(Vec<String>),
}

/// A parsed and post-processed server response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Response {
    /// Response tag: `*`, `+`, or a command tag.
    pub tag: String,
    /// Uppercase-normalized command name; empty for continuation prompts.
    pub command: String,
    /// Message sequence number of numeric untagged responses
    /// (`* 12 EXISTS`).
    pub nr: Option<u32>,
    /// Remaining attributes.
    pub attributes: Vec<Value>,
    /// Machine-readable `[CODE ...]` of a status response.
    pub code: Option<ResponseCode>,
    /// Trailing human-readable text of a status response or continuation
    /// prompt.
    pub human_readable: Option<String>,
    /// Untagged responses collected for the completed command, keyed by
    /// uppercased command name. Attached at tagged completion.
    pub payload: BTreeMap<String, Vec<Response>>,
}

impl Response {
    /// Creates a raw response, before post-processing.
    pub fn new(tag: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            command: command.into(),
            ..Self::default()
        }
    }

    /// Creates a continuation prompt response.
    pub fn continuation(text: impl Into<String>) -> Self {
        Self {
            tag: "+".to_string(),
            human_readable: Some(text.into()),
            ..Self::default()
        }
    }

    /// Returns `true` for untagged (`*`) responses.
    #[must_use]
    pub fn is_untagged(&self) -> bool {
        self.tag == "*"
    }

    /// Returns `true` for continuation (`+`) prompts.
    #[must_use]
    pub fn is_continuation(&self) -> bool {
        self.tag == "+"
    }

    /// Post-processes a freshly parsed response.
    ///
    /// Numeric untagged responses are promoted (`* 12 EXISTS` becomes
    /// `command = "EXISTS"`, `nr = 12`); status responses get their
    /// bracketed `[CODE ...]` lifted into [`Response::code`] and their
    /// trailing text into [`Response::human_readable`].
    pub fn process(&mut self) {
        if self.tag == "*"
            && let Ok(nr) = self.command.parse::<u32>()
            && matches!(self.attributes.first(), Some(Value::Atom(_)))
        {
            let Value::Atom(name) = self.attributes.remove(0) else {
                return;
            };
            self.nr = Some(nr);
            self.command = name.trim().to_ascii_uppercase();
        }

        if !is_status_command(&self.command) {
            return;
        }

        if let Some(Value::Text(text)) = self.attributes.last() {
            self.human_readable = Some(text.clone());
        }

        if let Some(Value::Section(entries)) = self.attributes.first() {
            let mut args: Vec<CodeArg> = entries
                .iter()
                .map(|entry| match entry {
                    Value::List(items) => CodeArg::List(
                        items.iter().map(|i| i.to_text().trim().to_string()).collect(),
                    ),
                    other => CodeArg::Value(other.to_text().trim().to_ascii_uppercase()),
                })
                .collect();
            if !args.is_empty() {
                if let CodeArg::Value(name) = args.remove(0) {
                    self.code = Some(ResponseCode { name, args });
                }
            }
        }
    }
}
