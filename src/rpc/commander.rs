//! Commander: sole owner of the logical connection.
//!
//! Callers on any task submit [`Command`]s; the Commander serializes them
//! into one queue and keeps at most one on the wire.  The wire carries no
//! correlation id, so a response is matched by comparing its echoed command
//! with the oldest pending request.
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────┐
//!  │  Commander                                                 │
//!  │                                                            │
//!  │  submit() ──▶ queue ──▶ write loop ──frame──▶ Transport    │
//!  │    ▲          (head)    retry / timeout                    │
//!  │    │                                                       │
//!  │  done signal ◀── on_frame() ◀── read loop ◀── Transport    │
//!  │                  (epoch + echo match)                      │
//!  └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every pending request is tagged with the connection epoch it was
//! submitted in.  A response read during an older epoch never completes a
//! request, and [`Commander::connection_lost`] fails the whole queue.

use core::cell::RefCell;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use futures_lite::future;
use log::{debug, info, warn};

use super::codec::{Annotation, FrameDecoder, FrameEvent, encode_frame};
use super::command::{Command, Response};
use super::handshake::Handshake;
use super::transport::Transport;
use crate::config::EngineConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::CommandError;
use crate::fsm::{ConnectionFsm, ConnectionState, Epoch, InvalidTransition};

const READ_BUF_SIZE: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(1);

type Completion = Signal<CriticalSectionRawMutex, Result<Response, CommandError>>;

/// Timing and size limits applied to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPolicy {
    /// Per-attempt response deadline.
    pub timeout: Duration,
    /// Resends after the first attempt.
    pub retry_limit: u32,
    pub max_frame_size: usize,
}

impl CommandPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.command_timeout(),
            retry_limit: config.retry_limit,
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// What the read path did with one incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDisposition {
    /// Completed the head request.
    Matched,
    /// No pending request matches the echoed command.
    Unexpected,
    /// Read during an epoch that is no longer current.
    Stale,
    /// Payload did not decode as a response.
    Malformed,
}

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Transport(io::ErrorKind),
    /// The epoch moved on or the connection was torn down.
    Closed,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(kind) => write!(f, "transport failed: {kind}"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    External,
    Internal,
}

// ── Pending requests ─────────────────────────────────────────

struct PendingRequest {
    id: u64,
    epoch: Epoch,
    command: Command,
    wire: Vec<u8>,
    timeout: Duration,
    sent: AtomicBool,
    abandoned: AtomicBool,
    done: Completion,
}

impl PendingRequest {
    fn is_sent(&self) -> bool {
        self.sent.load(Ordering::Acquire)
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::Acquire)
    }
}

/// Marks the request abandoned when the caller stops waiting.
struct AbandonOnDrop<'a>(&'a PendingRequest);

impl Drop for AbandonOnDrop<'_> {
    fn drop(&mut self) {
        self.0.abandoned.store(true, Ordering::Release);
    }
}

struct Shared {
    fsm: ConnectionFsm,
    queue: VecDeque<Arc<PendingRequest>>,
    next_id: u64,
    handshake: Option<Handshake>,
}

// ── Commander ────────────────────────────────────────────────

pub struct Commander {
    policy: CommandPolicy,
    shared: Mutex<Shared>,
    queued: Signal<CriticalSectionRawMutex, ()>,
    progress: Signal<CriticalSectionRawMutex, u64>,
    handshake_seen: Signal<CriticalSectionRawMutex, ()>,
    diagnostics: Diagnostics,
}

impl Commander {
    pub fn new(policy: CommandPolicy) -> Self {
        Self {
            policy,
            shared: Mutex::new(Shared {
                fsm: ConnectionFsm::new(),
                queue: VecDeque::new(),
                next_id: 0,
                handshake: None,
            }),
            queued: Signal::new(),
            progress: Signal::new(),
            handshake_seen: Signal::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> CommandPolicy {
        self.policy
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().fsm.state()
    }

    pub fn epoch(&self) -> Epoch {
        self.lock().fsm.epoch()
    }

    /// Welcome message received during the current epoch.
    pub fn handshake(&self) -> Option<Handshake> {
        self.lock().handshake.clone()
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    // ── Connection lifecycle (driven by the supervisor) ──────

    pub fn begin_connecting(&self) -> Result<(), InvalidTransition> {
        self.lock()
            .fsm
            .transition(ConnectionState::Connecting)
            .map(|_| ())
    }

    /// A transport is open: start a new epoch in `Synchronizing`.
    pub fn open_session(&self) -> Result<Epoch, InvalidTransition> {
        let epoch = {
            let mut shared = self.lock();
            let epoch = shared.fsm.transition(ConnectionState::Synchronizing)?;
            shared.handshake = None;
            epoch
        };
        self.handshake_seen.reset();
        self.diagnostics.connection();
        info!("Commander: session open, epoch {}", epoch);
        Ok(epoch)
    }

    /// Synchronization finished for `epoch`; accept external commands.
    pub fn mark_ready(&self, epoch: Epoch) -> Result<(), CommandError> {
        let mut shared = self.lock();
        if shared.fsm.epoch() != epoch {
            return Err(CommandError::ConnectionLost);
        }
        let state = shared.fsm.state();
        shared
            .fsm
            .transition(ConnectionState::Ready)
            .map(|_| ())
            .map_err(|_| CommandError::NotReady(state))
    }

    /// The transport for `epoch` is gone.  No-op if a newer epoch started.
    pub fn connection_lost(&self, epoch: Epoch) {
        if self.lock().fsm.epoch() == epoch {
            self.disconnect();
        }
    }

    /// Move to `Disconnected` and fail every outstanding request.
    pub fn disconnect(&self) {
        let drained: Vec<_> = {
            let mut shared = self.lock();
            if shared.fsm.state() != ConnectionState::Disconnected {
                let _ = shared.fsm.transition(ConnectionState::Disconnected);
            }
            shared.queue.drain(..).collect()
        };
        self.queued.signal(());
        if !drained.is_empty() {
            info!("Commander: failing {} pending requests", drained.len());
        }
        for pending in drained {
            pending.done.signal(Err(CommandError::ConnectionLost));
        }
    }

    // ── Submission ───────────────────────────────────────────

    /// Submit with the default per-attempt timeout.  Only accepted in `Ready`.
    pub async fn submit(&self, command: Command) -> Result<Response, CommandError> {
        self.submit_timeout(command, self.policy.timeout).await
    }

    pub async fn submit_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Response, CommandError> {
        self.enqueue(command, timeout, Origin::External).await
    }

    /// Submission path for synchronization; also accepted in `Synchronizing`.
    pub(crate) async fn submit_internal(
        &self,
        command: Command,
        timeout: Option<Duration>,
    ) -> Result<Response, CommandError> {
        let timeout = timeout.unwrap_or(self.policy.timeout);
        self.enqueue(command, timeout, Origin::Internal).await
    }

    async fn enqueue(
        &self,
        command: Command,
        timeout: Duration,
        origin: Origin,
    ) -> Result<Response, CommandError> {
        let payload = command.encode();
        let wire = encode_frame(&payload, self.policy.max_frame_size)
            .ok_or(CommandError::Oversize(payload.len()))?;

        let pending = {
            let mut shared = self.lock();
            let state = shared.fsm.state();
            let accepted = match origin {
                Origin::External => state == ConnectionState::Ready,
                Origin::Internal => matches!(
                    state,
                    ConnectionState::Synchronizing | ConnectionState::Ready
                ),
            };
            if !accepted {
                return Err(CommandError::NotReady(state));
            }
            shared.next_id += 1;
            let pending = Arc::new(PendingRequest {
                id: shared.next_id,
                epoch: shared.fsm.epoch(),
                command,
                wire,
                timeout,
                sent: AtomicBool::new(false),
                abandoned: AtomicBool::new(false),
                done: Signal::new(),
            });
            shared.queue.push_back(Arc::clone(&pending));
            pending
        };
        self.queued.signal(());

        let _abandon = AbandonOnDrop(&pending);
        let response = pending.done.wait().await?;
        if response.status.is_ok() {
            Ok(response)
        } else {
            Err(CommandError::Rejected {
                opcode: response.command.opcode(),
                code: response.status,
            })
        }
    }

    // ── Read path ────────────────────────────────────────────

    /// Match one frame payload read during `epoch` against the queue head.
    pub fn on_frame(&self, epoch: Epoch, payload: &[u8]) -> FrameDisposition {
        let response = match Response::decode(payload) {
            Ok(response) => response,
            Err(e) => {
                self.diagnostics.response_malformed();
                warn!("Commander: malformed response: {}", e);
                return FrameDisposition::Malformed;
            }
        };

        let head = {
            let mut shared = self.lock();
            if shared.fsm.epoch() != epoch {
                drop(shared);
                self.diagnostics.response_stale();
                debug!("Commander: discarding response from epoch {}", epoch);
                return FrameDisposition::Stale;
            }
            let matches = shared.queue.front().is_some_and(|head| {
                head.is_sent() && head.epoch == epoch && head.command == response.command
            });
            if !matches {
                drop(shared);
                self.diagnostics.response_unexpected();
                debug!("Commander: unexpected response to {}", response.command);
                return FrameDisposition::Unexpected;
            }
            shared.queue.pop_front()
        };

        if let Some(head) = head {
            head.done.signal(Ok(response));
            self.progress.signal(head.id);
        }
        FrameDisposition::Matched
    }

    fn on_event(&self, epoch: Epoch, event: FrameEvent) {
        match event {
            FrameEvent::Frame(frame) => {
                self.diagnostics.frame_received();
                self.on_frame(epoch, frame.payload());
            }
            FrameEvent::Annotation(Annotation::Event(text)) => {
                self.on_controller_event(epoch, &text);
            }
            FrameEvent::Annotation(Annotation::Log(text)) => info!("Controller: {}", text),
            FrameEvent::Corrupt(fault) => {
                self.diagnostics.frame_corrupt();
                warn!("Commander: dropped corrupt frame: {}", fault);
            }
        }
    }

    fn on_controller_event(&self, epoch: Epoch, text: &str) {
        let Some(handshake) = Handshake::parse(text) else {
            info!("Controller event: {}", text);
            return;
        };
        {
            let mut shared = self.lock();
            if shared.fsm.epoch() != epoch {
                return;
            }
            shared.handshake = Some(handshake.clone());
        }
        info!(
            "Commander: controller '{}' firmware {} protocol {} ({})",
            handshake.name, handshake.firmware_version, handshake.proto_version, handshake.platform
        );
        self.handshake_seen.signal(());
    }

    /// Resolves when a welcome message arrives.
    pub(crate) async fn handshake_seen(&self) {
        self.handshake_seen.wait().await;
    }

    async fn read_loop<T: Transport>(&self, epoch: Epoch, transport: &RefCell<T>) -> SessionEnd {
        let mut decoder = FrameDecoder::new(self.policy.max_frame_size);
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let read = transport.borrow_mut().read(&mut buf);
            match read {
                Ok(0) => {
                    Timer::after(POLL_INTERVAL).await;
                }
                Ok(n) => {
                    for event in decoder.feed(&buf[..n]) {
                        self.on_event(epoch, event);
                    }
                }
                Err(e) => {
                    info!("Commander: read failed: {}", e);
                    return SessionEnd::Transport(e.kind());
                }
            }
        }
    }

    // ── Write path ───────────────────────────────────────────

    fn next_head(&self, epoch: Epoch) -> Result<Option<Arc<PendingRequest>>, SessionEnd> {
        let mut shared = self.lock();
        if shared.fsm.epoch() != epoch || shared.fsm.state() == ConnectionState::Disconnected {
            return Err(SessionEnd::Closed);
        }
        loop {
            let Some(front) = shared.queue.front().map(Arc::clone) else {
                return Ok(None);
            };
            if front.is_abandoned() && !front.is_sent() {
                debug!("Commander: skipping abandoned {}", front.command);
                shared.queue.pop_front();
                continue;
            }
            return Ok(Some(front));
        }
    }

    fn is_head(&self, id: u64) -> bool {
        self.lock().queue.front().is_some_and(|head| head.id == id)
    }

    fn fail_head(&self, id: u64, error: CommandError) {
        let head = {
            let mut shared = self.lock();
            if !shared.queue.front().is_some_and(|head| head.id == id) {
                return;
            }
            shared.queue.pop_front()
        };
        if let Some(head) = head {
            head.done.signal(Err(error));
        }
    }

    async fn completed(&self, id: u64) -> bool {
        loop {
            if self.progress.wait().await == id {
                return true;
            }
        }
    }

    async fn dispatch<T: Transport>(
        &self,
        head: &PendingRequest,
        transport: &RefCell<T>,
    ) -> Result<(), SessionEnd> {
        let attempts = self.policy.retry_limit.saturating_add(1);
        for attempt in 1..=attempts {
            self.progress.reset();
            head.sent.store(true, Ordering::Release);
            write_all(transport, &head.wire).await?;
            self.diagnostics.command_sent();
            if attempt > 1 {
                self.diagnostics.retry();
                warn!(
                    "Commander: retrying {} (attempt {}/{})",
                    head.command, attempt, attempts
                );
            }

            let answered = future::or(self.completed(head.id), async {
                Timer::after(head.timeout).await;
                false
            })
            .await;
            if answered || !self.is_head(head.id) {
                return Ok(());
            }
        }

        self.diagnostics.timeout();
        warn!(
            "Commander: {} timed out after {} attempts",
            head.command, attempts
        );
        self.fail_head(
            head.id,
            CommandError::Timeout {
                opcode: head.command.opcode(),
                attempts,
            },
        );
        Ok(())
    }

    async fn write_loop<T: Transport>(&self, epoch: Epoch, transport: &RefCell<T>) -> SessionEnd {
        loop {
            let head = match self.next_head(epoch) {
                Err(end) => return end,
                Ok(Some(head)) => head,
                Ok(None) => {
                    self.queued.wait().await;
                    continue;
                }
            };
            if let Err(end) = self.dispatch(&head, transport).await {
                return end;
            }
        }
    }

    /// Drive reads and writes for `epoch` until the transport fails or the
    /// epoch ends.  The caller reports the loss via [`Self::connection_lost`].
    pub async fn run_session<T: Transport>(&self, epoch: Epoch, transport: T) -> SessionEnd {
        let transport = RefCell::new(transport);
        self.queued.signal(());
        future::or(
            self.read_loop(epoch, &transport),
            self.write_loop(epoch, &transport),
        )
        .await
    }
}

async fn write_all<T: Transport>(transport: &RefCell<T>, mut data: &[u8]) -> Result<(), SessionEnd> {
    let fail = |e: io::Error| {
        warn!("Commander: write failed: {}", e);
        SessionEnd::Transport(e.kind())
    };
    while !data.is_empty() {
        let written = transport.borrow_mut().write(data).map_err(fail)?;
        if written == 0 {
            Timer::after(POLL_INTERVAL).await;
            continue;
        }
        data = &data[written..];
    }
    transport.borrow_mut().flush().map_err(fail)
}
