//! Request structure and wire compilation.
//!
//! A [`Request`] is compiled into one or more wire chunks. The split points
//! are literal announcements: each chunk except the last ends with
//! `{n}\r\n`, and the following chunk begins with exactly `n` literal bytes.
//! The sender transmits the first chunk immediately and each further chunk
//! in response to a server continuation prompt; the terminating CRLF of the
//! whole command is appended by the sender, not the compiler.

use super::value::Value;

/// A structured client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command tag; assigned by the queue on enqueue.
    pub tag: String,
    /// Command name, e.g. `CAPABILITY` or `UID FETCH`.
    pub command: String,
    /// Command arguments.
    pub attributes: Vec<Value>,
}

impl Request {
    /// Creates a request with no arguments and an unassigned tag.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            tag: String::new(),
            command: command.into(),
            attributes: Vec::new(),
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn attr(mut self, value: Value) -> Self {
        self.attributes.push(value);
        self
    }
}

impl From<&str> for Request {
    fn from(command: &str) -> Self {
        Self::new(command)
    }
}

/// Compiles a request into ordered wire chunks.
///
/// The result is never empty; a request without literals compiles to a
/// single chunk.
#[must_use]
pub fn compile(request: &Request) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut out = Vec::new();

    out.extend_from_slice(request.tag.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.command.as_bytes());

    for attribute in &request.attributes {
        out.push(b' ');
        write_value(&mut chunks, &mut out, attribute);
    }

    chunks.push(out);
    chunks
}

fn write_value(chunks: &mut Vec<Vec<u8>>, out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Atom(s) | Value::Text(s) => out.extend_from_slice(s.as_bytes()),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::Quoted(s) => write_quoted(out, s),
        Value::Literal(data) => {
            // Announce, cut the chunk, then start the next one with the raw
            // payload. The server's continuation prompt sits between the two.
            out.extend_from_slice(format!("{{{}}}\r\n", data.len()).as_bytes());
            chunks.push(std::mem::take(out));
            out.extend_from_slice(data);
        }
        Value::List(items) => {
            out.push(b'(');
            write_items(chunks, out, items);
            out.push(b')');
        }
        Value::Section(items) => {
            out.push(b'[');
            write_items(chunks, out, items);
            out.push(b']');
        }
        Value::Nil => out.extend_from_slice(b"NIL"),
    }
}

fn write_items(chunks: &mut Vec<Vec<u8>>, out: &mut Vec<u8>, items: &[Value]) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push(b' ');
        }
        write_value(chunks, out, item);
    }
}

fn write_quoted(out: &mut Vec<u8>, s: &str) {
    out.push(b'"');
    for b in s.bytes() {
        if b == b'"' || b == b'\\' {
            out.push(b'\\');
        }
        out.push(b);
    }
    out.push(b'"');
}
