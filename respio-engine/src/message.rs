//! # Message Completion Core
//!
//! Purpose: Represent one outstanding request/response exchange that a
//! thread can block on or a task can await, with cancellation and timeout
//! racing the network result safely.
//!
//! ## Design Principles
//! 1. **Single-Assignment Latch**: `decided` is claimed once under the state
//!    lock by the first of {network completion, cancellation, timeout}; every
//!    later claimant is a no-op.
//! 2. **One Cell, Two Observers**: The outcome lives in one slot, observed by
//!    a condition variable (blocking path) or a continuation list (awaitable
//!    path). Registering a continuation disables the blocking path.
//! 3. **Generation Tokens**: Recycling bumps the generation, so stale
//!    completions and duplicate retrievals fail fast.
//! 4. **Independent Payload**: The request chunk is released as soon as it is
//!    transmitted or the exchange is decided, whichever comes first.
//!
//! ## State Progression
//!
//! ```text
//! created --begin_transmit--> sent --claim latch--> decided --install--> complete
//!    |                                                ^
//!    +------ cancel / fail / timeout -----------------+
//! ```

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use respio_common::{MessageError, MessageResult};

use crate::block::BlockChunk;
use crate::workers::ParseWorkers;

/// Turns one raw response frame into a typed result.
pub trait ResponseParser: Send + Sync + 'static {
    /// Parsed result type.
    type Output: Send + 'static;

    /// Parses one complete frame.
    fn parse(&self, frame: &[u8]) -> MessageResult<Self::Output>;

    /// Returns true when parsing is cheap enough to run on the I/O thread.
    fn inline_safe(&self) -> bool {
        true
    }
}

type AnyValue = Box<dyn Any + Send>;

trait ErasedParser: Send + Sync {
    fn parse_erased(&self, frame: &[u8]) -> MessageResult<AnyValue>;
    fn inline_safe(&self) -> bool;
}

impl<P: ResponseParser> ErasedParser for P {
    fn parse_erased(&self, frame: &[u8]) -> MessageResult<AnyValue> {
        self.parse(frame).map(|value| Box::new(value) as AnyValue)
    }

    fn inline_safe(&self) -> bool {
        ResponseParser::inline_safe(self)
    }
}

enum Continuation {
    Waker(Waker),
    Callback(Box<dyn FnOnce() + Send>),
}

impl Continuation {
    fn run(self) {
        match self {
            Continuation::Waker(waker) => waker.wake(),
            Continuation::Callback(callback) => callback(),
        }
    }
}

#[derive(Default)]
struct CoreState {
    generation: u64,
    sent: bool,
    decided: bool,
    complete: bool,
    no_notify: bool,
    outcome: Option<MessageResult<AnyValue>>,
    continuations: Vec<Continuation>,
    request: Option<BlockChunk>,
    parser: Option<Arc<dyn ErasedParser>>,
    command: String,
}

impl CoreState {
    /// Claims the decided latch for `token`.
    fn claim(&mut self, token: u64) -> bool {
        if self.generation != token || self.decided {
            return false;
        }
        self.decided = true;
        true
    }

    fn take_outcome(&mut self) -> MessageResult<AnyValue> {
        let outcome = self.outcome.take().unwrap_or(Err(MessageError::StaleToken));
        self.generation = self.generation.wrapping_add(1);
        outcome
    }
}

/// Recyclable completion state shared by the connection and the caller.
pub struct MessageCore {
    state: Mutex<CoreState>,
    ready: Condvar,
}

impl MessageCore {
    fn new() -> Self {
        MessageCore {
            state: Mutex::new(CoreState::default()),
            ready: Condvar::new(),
        }
    }

    /// Stores the outcome for `token` and wakes every observer.
    fn install(&self, token: u64, outcome: MessageResult<AnyValue>) {
        let continuations = {
            let mut state = self.state.lock();
            if state.generation != token || state.complete {
                return;
            }
            state.outcome = Some(outcome);
            state.complete = true;
            self.ready.notify_all();
            std::mem::take(&mut state.continuations)
        };
        for continuation in continuations {
            continuation.run();
        }
    }

    fn decide(&self, token: u64, outcome: MessageError) -> bool {
        {
            let mut state = self.state.lock();
            if !state.claim(token) {
                return false;
            }
            state.request = None;
            state.parser = None;
        }
        self.install(token, Err(outcome));
        true
    }

    fn wait(&self, token: u64, timeout: Option<Duration>) -> MessageResult<AnyValue> {
        let mut state = self.state.lock();
        if state.generation != token {
            return Err(MessageError::StaleToken);
        }
        if state.no_notify {
            return Err(MessageError::WaitAfterContinuation);
        }
        if !state.sent && !state.decided {
            return Err(MessageError::NotSent);
        }

        let mut deadline = timeout.map(|timeout| Instant::now() + timeout);
        while !state.complete {
            match deadline {
                Some(at) => {
                    let timed_out = self.ready.wait_until(&mut state, at).timed_out();
                    if timed_out && !state.complete {
                        if state.claim(token) {
                            state.request = None;
                            state.parser = None;
                            state.outcome = Some(Err(MessageError::TimedOut));
                            state.complete = true;
                        } else {
                            // Another outcome already won; it is being installed.
                            deadline = None;
                        }
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
        state.take_outcome()
    }

    fn poll(&self, token: u64, cx: &mut Context<'_>) -> Poll<MessageResult<AnyValue>> {
        let mut state = self.state.lock();
        if state.generation != token {
            return Poll::Ready(Err(MessageError::StaleToken));
        }
        state.no_notify = true;
        if state.complete {
            return Poll::Ready(state.take_outcome());
        }
        let waker = Continuation::Waker(cx.waker().clone());
        let registered = state
            .continuations
            .iter()
            .position(|c| matches!(c, Continuation::Waker(_)));
        match registered {
            Some(index) => state.continuations[index] = waker,
            None => state.continuations.push(waker),
        }
        Poll::Pending
    }

    fn register(&self, token: u64, callback: Box<dyn FnOnce() + Send>) {
        {
            let mut state = self.state.lock();
            if state.generation == token && !state.complete {
                state.no_notify = true;
                state.continuations.push(Continuation::Callback(callback));
                return;
            }
        }
        callback();
    }

    fn try_take(&self, token: u64) -> Option<MessageResult<AnyValue>> {
        let mut state = self.state.lock();
        if state.generation != token {
            return Some(Err(MessageError::StaleToken));
        }
        if !state.complete {
            return None;
        }
        Some(state.take_outcome())
    }

    /// Clears every slot and starts a new generation.
    fn reset(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        state.sent = false;
        state.decided = false;
        state.complete = false;
        state.no_notify = false;
        state.outcome = None;
        state.continuations.clear();
        state.request = None;
        state.parser = None;
        state.command.clear();
    }
}

/// Connection-side handle to one exchange.
#[derive(Clone)]
pub struct PendingOperation {
    core: Arc<MessageCore>,
    token: u64,
}

impl PendingOperation {
    /// Generation this handle was issued for.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Command name, for diagnostics.
    pub fn command(&self) -> String {
        let state = self.core.state.lock();
        if state.generation != self.token {
            return String::new();
        }
        state.command.clone()
    }

    /// Marks the exchange sent and hands over the request payload.
    ///
    /// Returns `Ok(None)` when the exchange was already decided (e.g.
    /// cancelled) and must not be written or awaited.
    pub fn begin_transmit(&self) -> MessageResult<Option<BlockChunk>> {
        let mut state = self.core.state.lock();
        if state.generation != self.token {
            return Err(MessageError::StaleToken);
        }
        if state.decided {
            state.request = None;
            return Ok(None);
        }
        state.sent = true;
        Ok(state.request.take())
    }

    /// Returns true once an outcome has been claimed.
    pub fn is_decided(&self) -> bool {
        let state = self.core.state.lock();
        state.generation != self.token || state.decided
    }

    /// Completes the exchange with one response frame.
    ///
    /// Inline-safe parsers run on the calling thread; others run on
    /// `workers` against their own copy of the frame. Returns false when
    /// another outcome already won.
    pub fn complete_with_frame(&self, frame: &[u8], workers: Option<&ParseWorkers>) -> bool {
        let parser = {
            let mut state = self.core.state.lock();
            if !state.sent || !state.claim(self.token) {
                return false;
            }
            state.parser.take()
        };
        let Some(parser) = parser else {
            self.core.install(self.token, Err(MessageError::UnexpectedResponse));
            return true;
        };

        match workers {
            Some(workers) if !parser.inline_safe() => {
                let frame = Bytes::copy_from_slice(frame);
                let core = Arc::clone(&self.core);
                let token = self.token;
                workers.spawn(move || {
                    let outcome = parser.parse_erased(&frame);
                    core.install(token, outcome);
                });
            }
            _ => {
                let outcome = parser.parse_erased(frame);
                self.core.install(self.token, outcome);
            }
        }
        true
    }

    /// Fails the exchange; a no-op when another outcome already won.
    pub fn fail(&self, err: MessageError) -> bool {
        self.core.decide(self.token, err)
    }

    /// Cancels the exchange; a no-op when another outcome already won.
    pub fn cancel(&self) -> bool {
        self.core.decide(self.token, MessageError::Cancelled)
    }
}

impl std::fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperation")
            .field("token", &self.token)
            .finish()
    }
}

/// Caller-side handle resolving to the typed response.
///
/// Dropping an undecided reply cancels it; the core is then recycled.
pub struct PendingReply<T> {
    core: Arc<MessageCore>,
    token: u64,
    pool: MessagePool,
    _output: PhantomData<fn() -> T>,
}

impl<T: Send + 'static> PendingReply<T> {
    /// Blocks until the outcome is available or `timeout` elapses.
    pub fn wait(self, timeout: Option<Duration>) -> MessageResult<T> {
        downcast(self.core.wait(self.token, timeout))
    }

    /// Takes the outcome if it is already available.
    pub fn try_take(&mut self) -> Option<MessageResult<T>> {
        self.core.try_take(self.token).map(downcast)
    }

    /// Cancels the exchange; returns false when an outcome already won.
    pub fn cancel(&self) -> bool {
        self.core.decide(self.token, MessageError::Cancelled)
    }

    /// Returns true once the outcome is available.
    pub fn is_complete(&self) -> bool {
        let state = self.core.state.lock();
        state.generation != self.token || state.complete
    }

    /// Runs `callback` with the outcome on whichever thread produces it.
    ///
    /// Blocking waits are no longer allowed on this exchange afterwards.
    pub fn on_complete<F>(self, callback: F)
    where
        F: FnOnce(MessageResult<T>) + Send + 'static,
    {
        let core = Arc::clone(&self.core);
        let token = self.token;
        let mut reply = self;
        core.register(
            token,
            Box::new(move || {
                let outcome = reply
                    .try_take()
                    .unwrap_or(Err(MessageError::StaleToken));
                drop(reply);
                callback(outcome);
            }),
        );
    }
}

impl<T: Send + 'static> Future for PendingReply<T> {
    type Output = MessageResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.core.poll(self.token, cx).map(downcast)
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.core.decide(self.token, MessageError::Cancelled);
        self.pool.recycle(Arc::clone(&self.core));
    }
}

fn downcast<T: 'static>(outcome: MessageResult<AnyValue>) -> MessageResult<T> {
    outcome.and_then(|value| {
        value
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| MessageError::UnexpectedResponse)
    })
}

struct MessagePoolInner {
    free: Mutex<Vec<Arc<MessageCore>>>,
    capacity: usize,
}

/// Bounded free list of message cores owned by one connection.
#[derive(Clone)]
pub struct MessagePool {
    inner: Arc<MessagePoolInner>,
}

impl MessagePool {
    /// Creates a pool keeping at most `capacity` idle cores.
    pub fn new(capacity: usize) -> Self {
        MessagePool {
            inner: Arc::new(MessagePoolInner {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
            }),
        }
    }

    /// Starts a new exchange for `command` carrying `request`.
    pub fn begin<P>(
        &self,
        command: &str,
        request: BlockChunk,
        parser: Arc<P>,
    ) -> (PendingOperation, PendingReply<P::Output>)
    where
        P: ResponseParser,
    {
        let core = self
            .inner
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(MessageCore::new()));
        let token = {
            let mut state = core.state.lock();
            state.command.push_str(command);
            state.request = Some(request);
            state.parser = Some(parser as Arc<dyn ErasedParser>);
            state.generation
        };
        let op = PendingOperation {
            core: Arc::clone(&core),
            token,
        };
        let reply = PendingReply {
            core,
            token,
            pool: self.clone(),
            _output: PhantomData,
        };
        (op, reply)
    }

    /// Idle cores currently pooled.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }

    fn recycle(&self, core: Arc<MessageCore>) {
        core.reset();
        let mut free = self.inner.free.lock();
        if free.len() < self.inner.capacity {
            free.push(core);
        }
    }
}
