//! IMAP grammar codec: request compilation and response parsing.
//!
//! The connection core only depends on this module through two operations:
//! [`compile`], which turns a structured [`Request`] into ordered wire
//! chunks split at literal boundaries, and [`parse_response`], which turns
//! one framed response unit into a [`Response`]. The value model is the
//! generic IMAP data tree; command-specific typing belongs to higher
//! layers.

mod parser;
mod request;
mod response;
mod value;

pub use parser::parse_response;
pub use request::{Request, compile};
pub use response::{CodeArg, Response, ResponseCode, is_status_command};
pub use value::Value;
