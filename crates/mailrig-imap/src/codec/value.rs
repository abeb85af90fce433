//! The IMAP data tree.
//!
//! Requests and responses are both built from the same small set of value
//! nodes: atoms, numbers, quoted strings, length-prefixed literals,
//! parenthesized lists, bracketed sections and trailing human-readable text.

use bytes::Bytes;

/// A single node in a request or response attribute tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A bare atom, e.g. `IMAP4rev1` or `\Seen`.
    Atom(String),
    /// A decimal number.
    Number(u64),
    /// A quoted string (unescaped content).
    Quoted(String),
    /// A `{n}`-announced literal: arbitrary bytes.
    Literal(Bytes),
    /// A parenthesized list of values.
    List(Vec<Value>),
    /// A bracketed section, e.g. the `[CAPABILITY ...]` of a status response.
    Section(Vec<Value>),
    /// Free-form trailing text of a status response.
    Text(String),
    /// The `NIL` atom.
    Nil,
}

impl Value {
    /// Builds a literal from anything byte-like.
    pub fn literal(bytes: impl Into<Bytes>) -> Self {
        Self::Literal(bytes.into())
    }

    /// Builds an atom from anything string-like.
    pub fn atom(s: impl Into<String>) -> Self {
        Self::Atom(s.into())
    }

    /// Returns `true` for the trailing-text node.
    #[must_use]
    pub const fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Returns the scalar content of this node rendered as text.
    ///
    /// Lists and sections have no scalar rendering and yield an empty string;
    /// literal bytes are rendered lossily.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Atom(s) | Self::Quoted(s) | Self::Text(s) => s.clone(),
            Self::Number(n) => n.to_string(),
            Self::Literal(b) => String::from_utf8_lossy(b).into_owned(),
            Self::Nil => "NIL".to_string(),
            Self::List(_) | Self::Section(_) => String::new(),
        }
    }
}
