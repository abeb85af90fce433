//! Connection lifecycle events.

use rustls::pki_types::CertificateDer;
use tokio::sync::mpsc;

use crate::Error;

/// An observable connection event.
#[derive(Debug)]
pub enum Event {
    /// The first server response was parsed; the connection is usable.
    Ready,
    /// The command queue stayed empty for the configured quiet time.
    Idle,
    /// A fatal error occurred; the connection has been torn down.
    Fatal(Error),
    /// The peer presented this leaf certificate during a TLS handshake.
    Certificate(CertificateDer<'static>),
}

/// The stream of [`Event`]s for one connection.
///
/// Dropping it is fine: events are then discarded.
#[derive(Debug)]
pub struct Events {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl Events {
    pub(crate) const fn new(rx: mpsc::UnboundedReceiver<Event>) -> Self {
        Self { rx }
    }

    /// Waits for the next event; `None` once the connection task is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Returns an already-delivered event without waiting.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}
