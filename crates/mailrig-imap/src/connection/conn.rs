//! The connection task.
//!
//! One task owns everything mutable about a connection: the transport, the
//! framing decoder, the command queue, the compression splice, the untagged
//! handler registry and both timers. Handles talk to it over a channel, so
//! all protocol state changes happen on a single logical execution context
//! and no locking is needed.
//!
//! Inbound path: socket bytes → (inflate) → framing → parse → post-process
//! → route. Outbound path: queue → compile → chunks → (deflate) → socket.

use std::collections::HashMap;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::client::{Client, PrecheckContext};
use super::compress::Splice;
use super::config::Config;
use super::events::Event;
use super::frame::FrameDecoder;
use super::queue::{CommandId, CommandQueue, DispatchAction, EnqueueOptions};
use super::stream::Transport;
use crate::codec::{Request, Response, parse_response};
use crate::{Error, Result};

/// A global untagged-response handler.
pub type Handler = Box<dyn FnMut(&Response) + Send>;

/// Requests from client handles to the connection task.
pub(crate) enum Op {
    Enqueue {
        request: Request,
        accept_untagged: Vec<String>,
        options: EnqueueOptions,
        done: oneshot::Sender<Result<Response>>,
    },
    SetHandler {
        command: String,
        handler: Handler,
    },
    EnableCompression {
        done: oneshot::Sender<Result<()>>,
    },
    Upgrade {
        done: oneshot::Sender<Result<()>>,
    },
    Logout {
        done: oneshot::Sender<Result<()>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
    /// Internal: a spawned precheck finished. Sent on the same channel as
    /// `Enqueue` so a precheck's own enqueues are processed first.
    PrecheckDone(CommandId, Result<()>),
}

/// What the select loop observed.
enum Step {
    Inbound(BytesMut),
    Eof,
    ReadFailed(std::io::Error),
    Op(Op),
    HandlesDropped,
    SocketTimeout(Duration),
    IdleTimeout,
}

/// The long-lived connection state machine.
pub(crate) struct Connection<S: Transport> {
    stream: Option<S>,
    config: Config,
    decoder: FrameDecoder,
    queue: CommandQueue,
    handlers: HashMap<String, Handler>,
    splice: Option<Splice>,
    ops: mpsc::UnboundedReceiver<Op>,
    /// Weak so that dropping every client handle ends the task; prechecks
    /// upgrade it for their lifetime.
    op_tx: mpsc::WeakUnboundedSender<Op>,
    events: mpsc::UnboundedSender<Event>,
    read_buf: BytesMut,
    /// First parsed response seen.
    greeted: bool,
    secure: bool,
    /// Response deadline armed by the last outbound send.
    socket_deadline: Option<(Instant, Duration)>,
    /// Pending idle notification.
    idle_deadline: Option<Instant>,
    logout_waiters: Vec<oneshot::Sender<Result<()>>>,
    /// A LOGOUT is pending; the server closing the socket is expected.
    expect_close: bool,
}

impl<S: Transport> Connection<S> {
    pub(crate) fn new(
        stream: S,
        config: Config,
        ops: mpsc::UnboundedReceiver<Op>,
        op_tx: mpsc::WeakUnboundedSender<Op>,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        let secure = stream.is_secure();
        Self {
            stream: Some(stream),
            config,
            decoder: FrameDecoder::new(),
            queue: CommandQueue::new(),
            handlers: HashMap::new(),
            splice: None,
            ops,
            op_tx,
            events,
            read_buf: BytesMut::with_capacity(8 * 1024),
            greeted: false,
            secure,
            socket_deadline: None,
            idle_deadline: None,
            logout_waiters: Vec::new(),
            expect_close: false,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(host = %self.config.host, secure = self.secure, "connection task started");
        if let Some(stream) = &self.stream
            && let Some(cert) = stream.peer_certificate()
        {
            let _ = self.events.send(Event::Certificate(cert));
        }

        loop {
            match self.next_step().await {
                Step::Inbound(chunk) => {
                    if let Err(error) = self.handle_inbound(chunk).await {
                        self.fatal(error).await;
                        break;
                    }
                }
                Step::Eof => {
                    self.handle_eof().await;
                    break;
                }
                Step::ReadFailed(error) => {
                    self.fatal(Error::Io(error)).await;
                    break;
                }
                Step::Op(op) => match self.handle_op(op).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(error) => {
                        self.fatal(error).await;
                        break;
                    }
                },
                Step::HandlesDropped => {
                    tracing::debug!("all handles dropped");
                    self.teardown().await;
                    break;
                }
                Step::SocketTimeout(waited) => {
                    self.fatal(Error::Timeout(waited)).await;
                    break;
                }
                Step::IdleTimeout => {
                    self.idle_deadline = None;
                    tracing::debug!("queue idle");
                    let _ = self.events.send(Event::Idle);
                }
            }
        }
    }

    async fn next_step(&mut self) -> Step {
        let socket_deadline = self.socket_deadline;
        let idle_deadline = self.idle_deadline;
        let Some(stream) = self.stream.as_mut() else {
            return Step::Eof;
        };

        tokio::select! {
            result = stream.read_buf(&mut self.read_buf) => match result {
                Ok(0) => Step::Eof,
                Ok(_) => Step::Inbound(self.read_buf.split()),
                Err(error) => Step::ReadFailed(error),
            },
            op = self.ops.recv() => op.map_or(Step::HandlesDropped, Step::Op),
            () = sleep_until_opt(socket_deadline.map(|(at, _)| at)) => {
                Step::SocketTimeout(socket_deadline.map_or(Duration::ZERO, |(_, waited)| waited))
            }
            () = sleep_until_opt(idle_deadline) => Step::IdleTimeout,
        }
    }

    /// Feeds received bytes through the splice and framing into the router.
    async fn handle_inbound(&mut self, chunk: BytesMut) -> Result<()> {
        // Any inbound byte cancels the response timeout.
        self.socket_deadline = None;

        let bytes = match self.splice.as_mut() {
            Some(splice) => splice.inflate(chunk.to_vec()).await?,
            None => chunk.to_vec(),
        };
        tracing::trace!(bytes = bytes.len(), "inbound chunk");

        self.decoder.push(&bytes);
        while let Some(unit) = self.decoder.next_unit()? {
            self.handle_unit(&unit).await?;
        }
        Ok(())
    }

    async fn handle_unit(&mut self, unit: &[u8]) -> Result<()> {
        tracing::trace!(unit = %String::from_utf8_lossy(unit), "response unit");
        let mut response = parse_response(unit)?;
        response.process();

        if !self.greeted {
            self.greeted = true;
            tracing::debug!("greeting received");
            let _ = self.events.send(Event::Ready);
        }

        self.route(response).await
    }

    /// Routes one processed response.
    async fn route(&mut self, mut response: Response) -> Result<()> {
        // Continuation prompts feed the current command's remaining chunks.
        if response.is_continuation() {
            if let Some(chunk) = self.queue.continuation_chunk() {
                return self.send(chunk).await;
            }
            if self.queue.current_expects_empty_line() {
                return self.send(b"\r\n".to_vec()).await;
            }
            tracing::debug!("ignoring continuation prompt");
            return Ok(());
        }

        let name = response.command.to_ascii_uppercase();

        // No command in flight: unsolicited traffic, then resume sending.
        if self.queue.current_tag().is_none() {
            if response.is_untagged() {
                self.invoke_handler(&name, &response);
            }
            self.queue.set_ready();
            return self.pump().await;
        }

        // Untagged claimed by the current command.
        if response.is_untagged() && self.queue.current_accepts(&name) {
            self.queue.push_payload(&name, response);
            return Ok(());
        }

        // Untagged the current command did not claim.
        if response.is_untagged() {
            self.invoke_handler(&name, &response);
            return Ok(());
        }

        // Tagged completion of the current command.
        if self.queue.current_tag() == Some(response.tag.as_str()) {
            let Some(mut command) = self.queue.complete_current() else {
                return Ok(());
            };
            if command.payload.values().any(|bucket| !bucket.is_empty()) {
                response.payload = std::mem::take(&mut command.payload);
            }
            let result = match name.as_str() {
                "NO" => Err(Error::No {
                    message: response.human_readable.clone().unwrap_or_default(),
                    code: response.code.clone(),
                }),
                "BAD" => Err(Error::Bad {
                    message: response.human_readable.clone().unwrap_or_default(),
                    code: response.code.clone(),
                }),
                _ => Ok(response),
            };
            tracing::debug!(tag = %command.tag, ok = result.is_ok(), "command completed");
            command.resolve(result);
            return self.pump().await;
        }

        tracing::warn!(tag = %response.tag, command = %name, "dropping unroutable response");
        Ok(())
    }

    fn invoke_handler(&mut self, name: &str, response: &Response) {
        if let Some(handler) = self.handlers.get_mut(name) {
            tracing::debug!(command = name, "invoking untagged handler");
            handler(response);
        }
    }

    /// Lets the queue decide the next step and carries it out.
    async fn pump(&mut self) -> Result<()> {
        self.idle_deadline = None;
        match self.queue.next_action() {
            DispatchAction::Send(bytes) => self.send(bytes).await,
            DispatchAction::RunPrecheck(id, precheck) => {
                let Some(tx) = self.op_tx.upgrade() else {
                    // Every handle is gone; nobody is left to observe the
                    // command anyway.
                    self.queue.precheck_failed(id, Error::Closed);
                    return Ok(());
                };
                let context = PrecheckContext::new(Client::from_sender(tx.clone()), id);
                tokio::spawn(async move {
                    let result = precheck(context).await;
                    let _ = tx.send(Op::PrecheckDone(id, result));
                });
                Ok(())
            }
            DispatchAction::EnterIdle => {
                self.idle_deadline = Some(Instant::now() + self.config.enter_idle_after);
                Ok(())
            }
            DispatchAction::Wait => Ok(()),
        }
    }

    /// Transmits one chunk, through the splice when compression is active,
    /// and arms the size-scaled response timeout.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        // The timeout scales with the cleartext size.
        let timeout = self.config.socket_timeout(bytes.len());
        self.socket_deadline = Some((Instant::now() + timeout, timeout));

        let wire = match self.splice.as_mut() {
            Some(splice) => splice.deflate(bytes).await?,
            None => bytes,
        };

        let Some(stream) = self.stream.as_mut() else {
            return Err(Error::Closed);
        };
        tracing::trace!(bytes = wire.len(), "outbound chunk");
        stream.write_all(&wire).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Handles one client request. `Ok(false)` stops the task.
    async fn handle_op(&mut self, op: Op) -> Result<bool> {
        match op {
            Op::Enqueue {
                request,
                accept_untagged,
                options,
                done,
            } => {
                self.idle_deadline = None;
                self.queue.enqueue(request, &accept_untagged, options, done);
                if self.queue.can_send() {
                    self.pump().await?;
                }
                Ok(true)
            }
            Op::SetHandler { command, handler } => {
                self.handlers.insert(command.to_ascii_uppercase(), handler);
                Ok(true)
            }
            Op::EnableCompression { done } => {
                if self.splice.is_some() {
                    let _ = done.send(Err(Error::InvalidState(
                        "compression already enabled".to_string(),
                    )));
                } else {
                    self.splice = Some(if self.config.compression_offload {
                        Splice::worker()
                    } else {
                        Splice::inline()
                    });
                    tracing::info!(
                        offload = self.config.compression_offload,
                        "compression enabled"
                    );
                    let _ = done.send(Ok(()));
                }
                Ok(true)
            }
            Op::Upgrade { done } => {
                let Some(stream) = self.stream.take() else {
                    let _ = done.send(Err(Error::Closed));
                    return Ok(true);
                };
                match stream
                    .upgrade(&self.config.host, &self.config.extra_roots)
                    .await
                {
                    Ok(upgraded) => {
                        self.secure = upgraded.is_secure();
                        if let Some(cert) = upgraded.peer_certificate() {
                            let _ = self.events.send(Event::Certificate(cert));
                        }
                        tracing::info!(secure = self.secure, "transport upgraded");
                        self.stream = Some(upgraded);
                        let _ = done.send(Ok(()));
                        Ok(true)
                    }
                    Err(error) => {
                        let message = error.to_string();
                        let _ = done.send(Err(error));
                        Err(Error::Protocol(format!("TLS upgrade failed: {message}")))
                    }
                }
            }
            Op::Logout { done } => {
                self.logout_waiters.push(done);
                self.expect_close = true;
                self.idle_deadline = None;
                // The completion of LOGOUT itself is not observable; the
                // server closing the socket is.
                let (tx, _rx) = oneshot::channel();
                self.queue
                    .enqueue(Request::new("LOGOUT"), &[], EnqueueOptions::default(), tx);
                if self.queue.can_send() {
                    self.pump().await?;
                }
                Ok(true)
            }
            Op::Close { done } => {
                tracing::debug!("close requested");
                self.teardown().await;
                let _ = done.send(());
                Ok(false)
            }
            Op::PrecheckDone(id, result) => {
                self.handle_precheck(id, result).await?;
                Ok(true)
            }
        }
    }

    async fn handle_precheck(&mut self, id: CommandId, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.queue.precheck_ok(),
            Err(error) => self.queue.precheck_failed(id, error),
        }
        self.pump().await
    }

    async fn handle_eof(&mut self) {
        if self.expect_close {
            tracing::debug!("server closed connection after logout");
            self.teardown().await;
        } else {
            self.fatal(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            )))
            .await;
        }
    }

    /// Fatal path: tear down first, then surface the error.
    async fn fatal(&mut self, error: Error) {
        tracing::error!(%error, "fatal connection error");
        self.teardown().await;
        let _ = self.events.send(Event::Fatal(error));
    }

    /// Cancels timers, rejects every outstanding command, dismantles the
    /// splice and closes the transport. Safe to call more than once.
    async fn teardown(&mut self) {
        self.socket_deadline = None;
        self.idle_deadline = None;
        self.queue.reject_all();
        for waiter in self.logout_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        if let Some(splice) = self.splice.take() {
            splice.shutdown();
        }
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
