//! # mailrig-imap
//!
//! The low-level transport core of an IMAP client: it multiplexes a single
//! duplex byte stream into tagged request/response exchanges, with correct
//! IMAP line+literal framing, untagged response routing, continuation
//! handling, a serialized command queue with priority insertion, and
//! optional on-the-wire COMPRESS=DEFLATE.
//!
//! ## Features
//!
//! - **Byte-clean framing**: literals (`{n}`/`{n+}`) are captured verbatim,
//!   whatever the chunk boundaries
//! - **One command in flight**: strict FIFO dispatch with enqueue-time
//!   priority insertion and precheck hooks
//! - **Continuation-driven sends**: multi-chunk commands interleave with
//!   the server's `+` prompts
//! - **TLS via rustls**: implicit TLS or in-place STARTTLS upgrade, without
//!   an OpenSSL dependency
//! - **COMPRESS=DEFLATE**: transparent splice, in-process or on a worker
//!   task
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailrig_imap::{Client, Config, Event, Request, Value};
//!
//! #[tokio::main]
//! async fn main() -> mailrig_imap::Result<()> {
//!     let config = Config::builder("imap.example.com").build();
//!     let (client, mut events) = Client::connect(config).await?;
//!
//!     // Wait for the server greeting.
//!     while let Some(event) = events.next().await {
//!         if matches!(event, Event::Ready) {
//!             break;
//!         }
//!     }
//!
//!     // Collect the CAPABILITY untagged response with its completion.
//!     let response = client
//!         .enqueue(Request::new("CAPABILITY"), &["CAPABILITY"])
//!         .await?;
//!     println!("capabilities: {:?}", response.payload.get("CAPABILITY"));
//!
//!     client.logout().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Scope
//!
//! This crate stops at the transport: no mailbox model, no session state,
//! no reconnect policy, no authentication schemes. Higher layers build
//! those on [`Client::enqueue`], the untagged handler registry and the
//! event stream.
//!
//! ## Modules
//!
//! - [`codec`]: request compilation and response parsing
//! - [`connection`]: framing, queue, compression splice, connection task

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod connection;
mod error;

pub use codec::{CodeArg, Request, Response, ResponseCode, Value, compile, parse_response};
pub use connection::{
    Client, CommandId, Config, ConfigBuilder, EnqueueOptions, Event, Events, FrameDecoder,
    Handler, ImapStream, Precheck, PrecheckContext, ScheduledCommand, Security, Transport,
    connect_plain, connect_tls,
};
pub use error::{Error, Result};
