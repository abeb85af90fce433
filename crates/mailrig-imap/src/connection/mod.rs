//! IMAP connection management.
//!
//! This module provides the transport core of an IMAP client:
//! - Configuration (host, port, security mode, timers)
//! - TLS/plaintext stream abstraction with in-place STARTTLS upgrade
//! - Response framing (lines plus literals)
//! - The serialized command queue with priority insertion and prechecks
//! - COMPRESS=DEFLATE splice
//! - The connection task tying it all together, driven through [`Client`]

mod client;
mod compress;
mod config;
mod conn;
mod events;
mod frame;
mod queue;
mod stream;

pub use client::{Client, PrecheckContext, ScheduledCommand};
pub use config::{Config, ConfigBuilder, Security};
pub use conn::Handler;
pub use events::{Event, Events};
pub use frame::FrameDecoder;
pub use queue::{CommandId, EnqueueOptions, Precheck};
pub use stream::{ImapStream, Transport, connect_plain, connect_tls, create_tls_connector};
