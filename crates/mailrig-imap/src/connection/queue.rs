//! Command queue and sender state machine.
//!
//! Commands are tagged on enqueue, dispatched strictly one at a time, and
//! resolved exactly once: with the tagged response, with a local error, or
//! with [`Error::Closed`] at teardown. Priority insertion is an
//! enqueue-time operation anchored on a still-queued command; prechecks
//! run when their command reaches the head and may enqueue ahead of it.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::pin::Pin;

use tokio::sync::oneshot;

use super::client::PrecheckContext;
use crate::codec::{Request, Response, compile};
use crate::{Error, Result};

/// A deferred check attached to a queued command.
///
/// Run when the command reaches the queue head; may enqueue preparatory
/// commands ahead of it through the provided [`PrecheckContext`]. A failed
/// precheck fails its command without touching the rest of the queue.
pub type Precheck =
    Box<dyn FnOnce(PrecheckContext) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send>;

/// Stable identity of a queued command, independent of tag rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub(crate) u64);

/// Options accepted when enqueuing a command.
#[derive(Default)]
pub struct EnqueueOptions {
    /// Insertion anchor: enqueue immediately before this still-queued
    /// command, inheriting its priority. Falls back to tail append when the
    /// anchor has already been dispatched.
    pub ctx: Option<CommandId>,
    /// Deferred check run when the command reaches the queue head.
    pub precheck: Option<Precheck>,
    /// Reply to a continuation prompt with an empty line once all chunks
    /// are sent (used by challenge-response exchanges to abort cleanly).
    pub empty_line_on_error: bool,
}

impl fmt::Debug for EnqueueOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnqueueOptions")
            .field("ctx", &self.ctx)
            .field("precheck", &self.precheck.is_some())
            .field("empty_line_on_error", &self.empty_line_on_error)
            .finish()
    }
}

/// One queued command.
pub(crate) struct QueuedCommand {
    pub(crate) id: CommandId,
    pub(crate) tag: String,
    pub(crate) request: Request,
    /// Compiled wire chunks; filled at dispatch, drained by continuation
    /// prompts.
    pub(crate) chunks: VecDeque<Vec<u8>>,
    pub(crate) accept_untagged: BTreeSet<String>,
    pub(crate) payload: BTreeMap<String, Vec<Response>>,
    done: oneshot::Sender<Result<Response>>,
    pub(crate) precheck: Option<Precheck>,
    pub(crate) empty_line_on_error: bool,
}

impl QueuedCommand {
    /// Resolves the command's completion; at most once by construction.
    pub(crate) fn resolve(self, result: Result<Response>) {
        // The handle may have been dropped; resolution is best-effort.
        let _ = self.done.send(result);
    }
}

/// Sender states.
///
/// `can_send` of the original corresponds to `Idle`, `Ready` and
/// `Precheck`: exactly the states with no command on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendState {
    /// Queue drained; the idle timer is armed.
    Idle,
    /// May dispatch the next queued command.
    Ready,
    /// A command is on the wire awaiting its tagged response.
    InFlight,
    /// The head command's precheck is running.
    Precheck,
    /// Closed or torn down; nothing dispatches anymore.
    Fatal,
}

/// What the connection should do next.
pub(crate) enum DispatchAction {
    /// Transmit these bytes and arm the response timeout.
    Send(Vec<u8>),
    /// Run this precheck; report completion with
    /// [`CommandQueue::precheck_ok`] / [`CommandQueue::precheck_failed`].
    RunPrecheck(CommandId, Precheck),
    /// Queue drained: arm the idle timer.
    EnterIdle,
    /// Nothing to do right now.
    Wait,
}

/// The serialized command queue.
pub(crate) struct CommandQueue {
    pending: VecDeque<QueuedCommand>,
    current: Option<QueuedCommand>,
    state: SendState,
    /// Flips on the first parsed response; nothing dispatches before the
    /// greeting.
    open: bool,
    tag_counter: u64,
    /// The command whose precheck is running. It cannot dispatch until the
    /// precheck resolves; commands inserted ahead of it still can.
    precheck_active: Option<CommandId>,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            current: None,
            state: SendState::Idle,
            open: false,
            tag_counter: 0,
            precheck_active: None,
        }
    }

    /// True when the sender may examine the queue: connection open and no
    /// command on the wire.
    pub(crate) fn can_send(&self) -> bool {
        self.open
            && matches!(
                self.state,
                SendState::Idle | SendState::Ready | SendState::Precheck
            )
    }

    pub(crate) const fn state(&self) -> SendState {
        self.state
    }

    pub(crate) fn current_tag(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.tag.as_str())
    }

    /// Marks the connection open and the sender ready. Called whenever a
    /// response arrives with no command in flight, the greeting included.
    pub(crate) fn set_ready(&mut self) {
        self.open = true;
        if matches!(self.state, SendState::Idle) {
            self.state = SendState::Ready;
        }
    }

    /// Tags and queues a command. Returns its stable id.
    pub(crate) fn enqueue(
        &mut self,
        mut request: Request,
        accept_untagged: &[String],
        options: EnqueueOptions,
        done: oneshot::Sender<Result<Response>>,
    ) -> CommandId {
        self.tag_counter += 1;
        let id = CommandId(self.tag_counter);
        let tag = format!("W{}", self.tag_counter);
        request.tag.clone_from(&tag);

        let mut payload = BTreeMap::new();
        let mut accept = BTreeSet::new();
        for name in accept_untagged {
            let name = name.to_ascii_uppercase();
            payload.insert(name.clone(), Vec::new());
            accept.insert(name);
        }

        let mut command = QueuedCommand {
            id,
            tag,
            request,
            chunks: VecDeque::new(),
            accept_untagged: accept,
            payload,
            done,
            precheck: options.precheck,
            empty_line_on_error: options.empty_line_on_error,
        };

        let anchor = options
            .ctx
            .and_then(|ctx| self.pending.iter().position(|c| c.id == ctx));
        match anchor {
            Some(index) => {
                // Priority insertion: both the new command and its anchor
                // pick up a ".p" suffix.
                if let Some(anchor) = self.pending.get_mut(index) {
                    anchor.tag.push_str(".p");
                    anchor.request.tag.clone_from(&anchor.tag);
                }
                command.tag.push_str(".p");
                command.request.tag.clone_from(&command.tag);
                tracing::debug!(tag = %command.tag, index, "queued priority command");
                self.pending.insert(index, command);
            }
            None => {
                tracing::debug!(tag = %command.tag, "queued command");
                self.pending.push_back(command);
            }
        }

        id
    }

    /// Examines the queue head and decides the next step.
    pub(crate) fn next_action(&mut self) -> DispatchAction {
        if !self.can_send() {
            return DispatchAction::Wait;
        }
        if self.pending.is_empty() {
            self.state = SendState::Idle;
            return DispatchAction::EnterIdle;
        }

        // The checked command holds the head until its precheck resolves;
        // only priority insertions ahead of it may overtake.
        if let Some(active) = self.precheck_active
            && self.pending.front().is_some_and(|head| head.id == active)
        {
            return DispatchAction::Wait;
        }

        if let Some(head) = self.pending.front_mut()
            && let Some(precheck) = head.precheck.take()
        {
            let id = head.id;
            self.state = SendState::Precheck;
            self.precheck_active = Some(id);
            tracing::debug!(tag = %head.tag, "running precheck");
            return DispatchAction::RunPrecheck(id, precheck);
        }

        let Some(mut command) = self.pending.pop_front() else {
            return DispatchAction::Wait;
        };
        command.chunks = compile(&command.request).into();
        let mut first = command.chunks.pop_front().unwrap_or_default();
        if command.chunks.is_empty() {
            first.extend_from_slice(b"\r\n");
        }

        tracing::debug!(tag = %command.tag, chunks_left = command.chunks.len(), "dispatching");
        self.state = SendState::InFlight;
        self.current = Some(command);
        DispatchAction::Send(first)
    }

    /// Reports a successful precheck, releasing the checked command for
    /// dispatch. The caller should re-examine the queue.
    pub(crate) fn precheck_ok(&mut self) {
        self.precheck_active = None;
        if matches!(self.state, SendState::Precheck) {
            self.state = SendState::Ready;
        }
    }

    /// Reports a failed precheck: the affected command is removed and
    /// failed; the rest of the queue is untouched. The caller should
    /// re-examine the queue.
    pub(crate) fn precheck_failed(&mut self, id: CommandId, error: Error) {
        self.precheck_active = None;
        if let Some(index) = self.pending.iter().position(|c| c.id == id)
            && let Some(command) = self.pending.remove(index)
        {
            tracing::debug!(tag = %command.tag, "precheck failed");
            command.resolve(Err(error));
        }
        if matches!(self.state, SendState::Precheck) {
            self.state = SendState::Ready;
        }
    }

    /// True when the current command collects this untagged command name.
    pub(crate) fn current_accepts(&self, command: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.accept_untagged.contains(command))
    }

    /// Adds an untagged response to the current command's bucket.
    pub(crate) fn push_payload(&mut self, command: &str, response: Response) {
        if let Some(current) = self.current.as_mut()
            && let Some(bucket) = current.payload.get_mut(command)
        {
            bucket.push(response);
        }
    }

    /// Pops the next chunk of the current command for a continuation
    /// prompt, CRLF-terminated when it is the last one.
    pub(crate) fn continuation_chunk(&mut self) -> Option<Vec<u8>> {
        let current = self.current.as_mut()?;
        let mut chunk = current.chunks.pop_front()?;
        if current.chunks.is_empty() {
            chunk.extend_from_slice(b"\r\n");
        }
        Some(chunk)
    }

    /// True when the current command answers an unexpected continuation
    /// prompt with an empty line.
    pub(crate) fn current_expects_empty_line(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| c.empty_line_on_error && c.chunks.is_empty())
    }

    /// Takes the current command on tagged completion.
    pub(crate) fn complete_current(&mut self) -> Option<QueuedCommand> {
        let command = self.current.take()?;
        self.state = SendState::Ready;
        Some(command)
    }

    /// Fails every queued and in-flight command and stops the sender.
    pub(crate) fn reject_all(&mut self) {
        self.state = SendState::Fatal;
        self.open = false;
        for command in self.current.take().into_iter().chain(self.pending.drain(..)) {
            tracing::debug!(tag = %command.tag, "rejecting on teardown");
            command.resolve(Err(Error::Closed));
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    fn open_queue() -> CommandQueue {
        let mut queue = CommandQueue::new();
        queue.set_ready();
        queue
    }

    fn push(
        queue: &mut CommandQueue,
        command: &str,
        options: EnqueueOptions,
    ) -> (CommandId, oneshot::Receiver<Result<Response>>) {
        let (tx, rx) = oneshot::channel();
        let id = queue.enqueue(Request::new(command), &[], options, tx);
        (id, rx)
    }

    #[test]
    fn test_tags_are_monotonic_and_unique() {
        let mut queue = open_queue();
        push(&mut queue, "NOOP", EnqueueOptions::default());
        push(&mut queue, "NOOP", EnqueueOptions::default());

        let tags: Vec<_> = queue.pending.iter().map(|c| c.tag.clone()).collect();
        assert_eq!(tags, vec!["W1", "W2"]);
    }

    #[test]
    fn test_nothing_dispatches_before_greeting() {
        let mut queue = CommandQueue::new();
        push(&mut queue, "NOOP", EnqueueOptions::default());
        assert!(!queue.can_send());
        assert!(matches!(queue.next_action(), DispatchAction::Wait));

        queue.set_ready();
        assert!(matches!(queue.next_action(), DispatchAction::Send(_)));
    }

    #[test]
    fn test_dispatch_appends_crlf_to_single_chunk() {
        let mut queue = open_queue();
        push(&mut queue, "CAPABILITY", EnqueueOptions::default());

        let DispatchAction::Send(bytes) = queue.next_action() else {
            panic!("expected dispatch");
        };
        assert_eq!(bytes, b"W1 CAPABILITY\r\n");
        assert_eq!(queue.state(), SendState::InFlight);
        assert!(!queue.can_send());
    }

    #[test]
    fn test_multi_chunk_dispatch_and_continuation() {
        let mut queue = open_queue();
        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new("LOGIN")
                .attr(crate::codec::Value::atom("user"))
                .attr(crate::codec::Value::literal(&b"pass"[..])),
            &[],
            EnqueueOptions::default(),
            tx,
        );

        let DispatchAction::Send(first) = queue.next_action() else {
            panic!("expected dispatch");
        };
        // Announcement chunk goes out bare; the prompt drives the rest.
        assert_eq!(first, b"W1 LOGIN user {4}\r\n");

        assert_eq!(queue.continuation_chunk().unwrap(), b"pass\r\n");
        assert!(queue.continuation_chunk().is_none());
    }

    #[test]
    fn test_priority_insertion_suffixes_both_tags() {
        let mut queue = open_queue();
        let (main_id, _rx1) = push(&mut queue, "SELECT", EnqueueOptions::default());
        push(
            &mut queue,
            "NOOP",
            EnqueueOptions {
                ctx: Some(main_id),
                ..EnqueueOptions::default()
            },
        );

        let tags: Vec<_> = queue.pending.iter().map(|c| c.tag.clone()).collect();
        assert_eq!(tags, vec!["W2.p", "W1.p"]);
        let wire_tags: Vec<_> = queue.pending.iter().map(|c| c.request.tag.clone()).collect();
        assert_eq!(wire_tags, tags);
    }

    #[test]
    fn test_priority_insertion_falls_back_to_tail() {
        let mut queue = open_queue();
        let (dispatched_id, _rx1) = push(&mut queue, "SELECT", EnqueueOptions::default());
        assert!(matches!(queue.next_action(), DispatchAction::Send(_)));

        // The anchor left the queue; no suffixing, plain append.
        push(
            &mut queue,
            "NOOP",
            EnqueueOptions {
                ctx: Some(dispatched_id),
                ..EnqueueOptions::default()
            },
        );
        assert_eq!(queue.pending.back().unwrap().tag, "W2");
        assert_eq!(queue.current_tag(), Some("W1"));
    }

    #[test]
    fn test_empty_queue_enters_idle() {
        let mut queue = open_queue();
        assert!(matches!(queue.next_action(), DispatchAction::EnterIdle));
        assert_eq!(queue.state(), SendState::Idle);
    }

    #[test]
    fn test_precheck_detaches_and_restarts_when_quiet() {
        let mut queue = open_queue();
        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new("FETCH"),
            &[],
            EnqueueOptions {
                precheck: Some(Box::new(|_ctx| Box::pin(async { Ok(()) }))),
                ..EnqueueOptions::default()
            },
            tx,
        );

        let DispatchAction::RunPrecheck(_, _) = queue.next_action() else {
            panic!("expected precheck");
        };
        assert_eq!(queue.state(), SendState::Precheck);
        // Still sendable: the precheck may enqueue ahead of the head.
        assert!(queue.can_send());

        // Nothing was enqueued during the precheck; completion releases the
        // command.
        queue.precheck_ok();
        let DispatchAction::Send(bytes) = queue.next_action() else {
            panic!("expected dispatch after precheck");
        };
        assert_eq!(bytes, b"W1 FETCH\r\n");
    }

    #[test]
    fn test_priority_insertion_overtakes_checked_command() {
        let mut queue = open_queue();
        let (main_id, _rx1) = {
            let (tx, rx) = oneshot::channel();
            let id = queue.enqueue(
                Request::new("FETCH"),
                &[],
                EnqueueOptions {
                    precheck: Some(Box::new(|_ctx| Box::pin(async { Ok(()) }))),
                    ..EnqueueOptions::default()
                },
                tx,
            );
            (id, rx)
        };
        assert!(matches!(
            queue.next_action(),
            DispatchAction::RunPrecheck(_, _)
        ));

        // The precheck enqueues SELECT ahead of FETCH: it overtakes the
        // checked command.
        push(
            &mut queue,
            "SELECT",
            EnqueueOptions {
                ctx: Some(main_id),
                ..EnqueueOptions::default()
            },
        );
        let DispatchAction::Send(bytes) = queue.next_action() else {
            panic!("expected priority dispatch");
        };
        assert_eq!(bytes, b"W2.p SELECT\r\n");

        // Even once SELECT completes, FETCH stays blocked until its
        // precheck resolves.
        queue.complete_current().unwrap().resolve(Ok(Response::new("W2.p", "OK")));
        assert!(matches!(queue.next_action(), DispatchAction::Wait));

        queue.precheck_ok();
        let DispatchAction::Send(bytes) = queue.next_action() else {
            panic!("expected dispatch after precheck");
        };
        assert_eq!(bytes, b"W1.p FETCH\r\n");
    }

    #[test]
    fn test_tail_enqueue_cannot_overtake_checked_command() {
        let mut queue = open_queue();
        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new("FETCH"),
            &[],
            EnqueueOptions {
                precheck: Some(Box::new(|_ctx| Box::pin(async { Ok(()) }))),
                ..EnqueueOptions::default()
            },
            tx,
        );
        assert!(matches!(
            queue.next_action(),
            DispatchAction::RunPrecheck(_, _)
        ));

        // A plain enqueue behind the checked command must wait its turn.
        push(&mut queue, "NOOP", EnqueueOptions::default());
        assert!(matches!(queue.next_action(), DispatchAction::Wait));

        queue.precheck_ok();
        let DispatchAction::Send(bytes) = queue.next_action() else {
            panic!("expected dispatch after precheck");
        };
        assert_eq!(bytes, b"W1 FETCH\r\n");
    }

    #[test]
    fn test_precheck_failure_fails_only_its_command() {
        let mut queue = open_queue();
        let (id, mut rx) = push(
            &mut queue,
            "FETCH",
            EnqueueOptions {
                precheck: Some(Box::new(|_ctx| {
                    Box::pin(async { Err(Error::InvalidState("no mailbox".to_string())) })
                })),
                ..EnqueueOptions::default()
            },
        );
        let (_other, mut other_rx) = push(&mut queue, "NOOP", EnqueueOptions::default());

        assert!(matches!(
            queue.next_action(),
            DispatchAction::RunPrecheck(_, _)
        ));
        queue.precheck_failed(id, Error::InvalidState("no mailbox".to_string()));

        assert!(matches!(rx.try_recv().unwrap(), Err(Error::InvalidState(_))));
        assert!(matches!(other_rx.try_recv(), Err(TryRecvError::Empty)));

        // The queue moves on to the untouched command.
        let DispatchAction::Send(bytes) = queue.next_action() else {
            panic!("expected dispatch");
        };
        assert_eq!(bytes, b"W2 NOOP\r\n");
    }

    #[test]
    fn test_payload_buckets() {
        let mut queue = open_queue();
        let (tx, _rx) = oneshot::channel();
        queue.enqueue(
            Request::new("CAPABILITY"),
            &["capability".to_string()],
            EnqueueOptions::default(),
            tx,
        );
        assert!(matches!(queue.next_action(), DispatchAction::Send(_)));

        assert!(queue.current_accepts("CAPABILITY"));
        assert!(!queue.current_accepts("EXISTS"));

        queue.push_payload("CAPABILITY", Response::new("*", "CAPABILITY"));
        let command = queue.complete_current().unwrap();
        assert_eq!(command.payload["CAPABILITY"].len(), 1);
        assert_eq!(queue.state(), SendState::Ready);
    }

    #[test]
    fn test_reject_all_resolves_everything() {
        let mut queue = open_queue();
        let (_id1, mut rx1) = push(&mut queue, "FETCH", EnqueueOptions::default());
        let (_id2, mut rx2) = push(&mut queue, "NOOP", EnqueueOptions::default());
        assert!(matches!(queue.next_action(), DispatchAction::Send(_)));

        queue.reject_all();
        assert!(matches!(rx1.try_recv().unwrap(), Err(Error::Closed)));
        assert!(matches!(rx2.try_recv().unwrap(), Err(Error::Closed)));
        assert_eq!(queue.state(), SendState::Fatal);
        assert!(!queue.can_send());
    }
}
