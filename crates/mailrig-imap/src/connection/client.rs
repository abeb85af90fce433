//! The public connection handle.

use std::future::IntoFuture;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

use super::config::{Config, Security};
use super::conn::{Connection, Op};
use super::events::Events;
use super::queue::{CommandId, EnqueueOptions};
use super::stream::{Transport, connect_plain, connect_tls};
use crate::codec::{Request, Response};
use crate::{Error, Result};

/// Handle to one IMAP connection.
///
/// Cheap to clone; all clones drive the same connection task. The
/// connection tears itself down when every handle is dropped.
#[derive(Debug, Clone)]
pub struct Client {
    tx: mpsc::UnboundedSender<Op>,
}

impl Client {
    /// Opens the transport per the configuration and spawns the connection
    /// task.
    ///
    /// Completes when the socket is open, not when the server greeting
    /// arrives; watch [`Events`] for [`Event::Ready`](super::Event::Ready).
    ///
    /// # Errors
    ///
    /// Fails when the TCP connect or TLS handshake fails.
    pub async fn connect(config: Config) -> Result<(Self, Events)> {
        let stream = match config.security {
            Security::Implicit => {
                connect_tls(&config.host, config.port, &config.extra_roots).await?
            }
            Security::None | Security::StartTls => {
                connect_plain(&config.host, config.port).await?
            }
        };
        Ok(Self::from_stream(stream, config))
    }

    /// Spawns the connection task over an already-open transport.
    pub fn from_stream<S: Transport>(stream: S, config: Config) -> (Self, Events) {
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(stream, config, op_rx, op_tx.downgrade(), event_tx);
        tokio::spawn(connection.run());
        (Self { tx: op_tx }, Events::new(event_rx))
    }

    pub(crate) const fn from_sender(tx: mpsc::UnboundedSender<Op>) -> Self {
        Self { tx }
    }

    /// Queues a command and returns its pending completion.
    ///
    /// `accept_untagged` names the untagged response commands this command
    /// collects into its payload (case-insensitive).
    pub fn enqueue(&self, request: impl Into<Request>, accept_untagged: &[&str]) -> ScheduledCommand {
        self.enqueue_with(request, accept_untagged, EnqueueOptions::default())
    }

    /// Queues a command with explicit options (priority anchor, precheck,
    /// empty-line continuation fallback).
    pub fn enqueue_with(
        &self,
        request: impl Into<Request>,
        accept_untagged: &[&str],
        options: EnqueueOptions,
    ) -> ScheduledCommand {
        let (done, rx) = oneshot::channel();
        // A failed send drops `done`, which resolves the handle as Closed.
        let _ = self.tx.send(Op::Enqueue {
            request: request.into(),
            accept_untagged: accept_untagged.iter().map(ToString::to_string).collect(),
            options,
            done,
        });
        ScheduledCommand { rx }
    }

    /// Registers a global handler for an untagged response command.
    ///
    /// The handler sees every matching untagged response the current
    /// command did not claim.
    pub fn set_handler(
        &self,
        command: impl Into<String>,
        handler: impl FnMut(&Response) + Send + 'static,
    ) {
        let _ = self.tx.send(Op::SetHandler {
            command: command.into(),
            handler: Box::new(handler),
        });
    }

    /// Installs the COMPRESS=DEFLATE splice.
    ///
    /// The caller must have negotiated `COMPRESS=DEFLATE` with the server
    /// first; every byte after the server's OK is compressed.
    ///
    /// # Errors
    ///
    /// Fails when compression is already enabled or the connection is gone.
    pub async fn enable_compression(&self) -> Result<()> {
        self.round_trip(|done| Op::EnableCompression { done }).await
    }

    /// Upgrades the transport to TLS in place (STARTTLS).
    ///
    /// # Errors
    ///
    /// Fails when the handshake fails or the transport is already TLS.
    pub async fn upgrade(&self) -> Result<()> {
        self.round_trip(|done| Op::Upgrade { done }).await
    }

    /// Enqueues LOGOUT and waits for the server to close the socket.
    ///
    /// # Errors
    ///
    /// Fails only when the connection is already gone.
    pub async fn logout(&self) -> Result<()> {
        self.round_trip(|done| Op::Logout { done }).await
    }

    /// Tears the connection down: rejects outstanding commands, cancels
    /// timers, disables compression and closes the transport.
    ///
    /// Idempotent; always completes.
    pub async fn close(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(Op::Close { done }).is_ok() {
            let _ = rx.await;
        }
    }

    async fn round_trip(&self, build: impl FnOnce(oneshot::Sender<Result<()>>) -> Op) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.tx.send(build(done)).map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }
}

/// A queued command's pending completion.
///
/// Resolves with the processed tagged response (payload attached) or with
/// the mapped error: [`Error::No`]/[`Error::Bad`] for rejected commands,
/// [`Error::Closed`] when the connection went away first.
#[derive(Debug)]
pub struct ScheduledCommand {
    rx: oneshot::Receiver<Result<Response>>,
}

impl ScheduledCommand {
    /// Waits for the tagged completion.
    ///
    /// # Errors
    ///
    /// See the type-level documentation.
    pub async fn response(self) -> Result<Response> {
        self.rx.await.map_err(|_| Error::Closed)?
    }
}

impl IntoFuture for ScheduledCommand {
    type Output = Result<Response>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.response())
    }
}

/// Handed to a precheck when its command reaches the queue head.
///
/// Preparatory commands enqueued through [`PrecheckContext::enqueue_before`]
/// jump ahead of the checked command and inherit its priority.
pub struct PrecheckContext {
    client: Client,
    id: CommandId,
}

impl PrecheckContext {
    pub(crate) const fn new(client: Client, id: CommandId) -> Self {
        Self { client, id }
    }

    /// The connection handle, for ordinary (tail) enqueues.
    #[must_use]
    pub const fn client(&self) -> &Client {
        &self.client
    }

    /// Identity of the command this precheck belongs to.
    #[must_use]
    pub const fn command_id(&self) -> CommandId {
        self.id
    }

    /// Queues a command immediately ahead of the checked command.
    pub fn enqueue_before(
        &self,
        request: impl Into<Request>,
        accept_untagged: &[&str],
    ) -> ScheduledCommand {
        let options = EnqueueOptions {
            ctx: Some(self.id),
            ..EnqueueOptions::default()
        };
        self.client.enqueue_with(request, accept_untagged, options)
    }
}

impl std::fmt::Debug for PrecheckContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrecheckContext")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
