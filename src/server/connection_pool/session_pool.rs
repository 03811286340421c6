use super::{Connector, PoolConfig, PoolError, Session};
use crate::target::Target;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

struct IdleSession<S> {
    session: S,
    deadline: Instant,
}

/// What a queued acquirer receives.
enum Grant<S> {
    /// A released session, still counted as checked out.
    Session(S),
    /// A reserved slot: the receiver has to open the session itself.
    Slot,
    Closed,
}

struct Waiter<S> {
    id: u64,
    tx: oneshot::Sender<Grant<S>>,
}

struct PoolState<S> {
    idle: VecDeque<IdleSession<S>>,
    // Includes slots reserved for factory calls still in flight.
    checked_out: usize,
    waiters: VecDeque<Waiter<S>>,
    next_waiter_id: u64,
    closed: bool,
}

impl<S> PoolState<S> {
    fn total(&self) -> usize {
        self.checked_out + self.idle.len()
    }

    fn take_expired(&mut self, now: Instant) -> Vec<S> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.idle.len());
        for idle in self.idle.drain(..) {
            if idle.deadline <= now {
                expired.push(idle.session);
            } else {
                kept.push_back(idle);
            }
        }
        self.idle = kept;
        expired
    }

    /// Offer `grant` to the oldest live waiter. Gives it back if nobody took it.
    fn hand_over(&mut self, mut grant: Grant<S>) -> Option<Grant<S>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(grant) {
                Ok(()) => {
                    trace!("Handed over to waiter #{}", waiter.id);
                    return None;
                }
                // The waiter went away without deregistering.
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    /// Put a checked-out session back. Returns it if it has to be closed instead.
    fn check_in(&mut self, session: S, idle_timeout: std::time::Duration) -> Option<S> {
        debug_assert!(self.checked_out > 0, "release without a matching acquire");
        if self.closed {
            self.checked_out = self.checked_out.saturating_sub(1);
            return Some(session);
        }
        match self.hand_over(Grant::Session(session)) {
            None => None,
            Some(Grant::Session(session)) => {
                self.checked_out = self.checked_out.saturating_sub(1);
                self.idle.push_back(IdleSession {
                    session,
                    deadline: Instant::now() + idle_timeout,
                });
                None
            }
            Some(_) => unreachable!("hand_over returns the grant it was given"),
        }
    }

    /// Give up one checked-out slot, passing it on to a waiter if there is one.
    fn free_slot(&mut self) {
        debug_assert!(self.checked_out > 0, "slot freed twice");
        if self.closed || self.hand_over(Grant::Slot).is_some() {
            self.checked_out = self.checked_out.saturating_sub(1);
        }
    }
}

enum Step<S> {
    Ready(S),
    Open,
    Wait(u64, oneshot::Receiver<Grant<S>>),
}

/// Point-in-time view of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub checked_out: usize,
    pub waiters: usize,
    pub capacity: usize,
    pub closed: bool,
}

/// Sessions of exactly one target.
pub struct SessionPool<C: Connector> {
    target: Target,
    connector: Arc<C>,
    config: PoolConfig,
    state: Mutex<PoolState<C::Session>>,
}

impl<C: Connector> SessionPool<C> {
    pub(super) fn new(target: Target, connector: Arc<C>, config: PoolConfig) -> Self {
        Self {
            target,
            connector,
            config,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: 0,
                waiters: VecDeque::new(),
                next_waiter_id: 0,
                closed: false,
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState<C::Session>> {
        // No code path panics while holding the lock, the state stays consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        PoolStats {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            waiters: state.waiters.len(),
            capacity: self.config.capacity,
            closed: state.closed,
        }
    }

    pub(super) async fn acquire(
        self: &Arc<Self>,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledSession<C>, PoolError> {
        let (step, expired) = self.begin_acquire()?;

        // Whatever `begin_acquire` counted must be owned by a guard before the
        // first await, so dropping this future cannot leak the slot.
        match step {
            Step::Ready(session) => {
                trace!("Reusing idle session to {}", self.target.name);
                let handle = PooledSession::new(session, self.clone());
                self.close_sessions(expired, "idle timeout").await;
                Ok(handle)
            }
            Step::Open => {
                let reservation = Reservation {
                    pool: self,
                    armed: true,
                };
                self.close_sessions(expired, "idle timeout").await;
                self.open_reserved(reservation).await
            }
            Step::Wait(id, rx) => {
                let waiting = Waiting {
                    pool: self,
                    id,
                    rx,
                    settled: false,
                };
                self.close_sessions(expired, "idle timeout").await;
                self.wait(waiting, cancel).await
            }
        }
    }

    fn begin_acquire(&self) -> Result<(Step<C::Session>, Vec<C::Session>), PoolError> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(PoolError::Closed(self.target.name.clone()));
        }
        let expired = state.take_expired(Instant::now());

        let step = if let Some(idle) = state.idle.pop_back() {
            state.checked_out += 1;
            Step::Ready(idle.session)
        } else if state.total() < self.config.capacity {
            state.checked_out += 1;
            Step::Open
        } else {
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            trace!(
                "Pool for {} at capacity, queued waiter #{} ({} waiting)",
                self.target.name,
                id,
                state.waiters.len()
            );
            Step::Wait(id, rx)
        };
        Ok((step, expired))
    }

    /// Open a session into a slot already counted in `checked_out`.
    async fn open_reserved(
        self: &Arc<Self>,
        mut reservation: Reservation<'_, C>,
    ) -> Result<PooledSession<C>, PoolError> {
        let session = match self.connector.connect(&self.target).await {
            Ok(session) => session,
            Err(e) => {
                return Err(PoolError::Factory {
                    target: self.target.name.clone(),
                    source: Box::new(e),
                })
            }
        };

        if self.lock_state().closed {
            // Dropping the reservation releases the slot.
            drop(reservation);
            self.close_sessions(vec![session], "pool closed").await;
            return Err(PoolError::Closed(self.target.name.clone()));
        }

        reservation.armed = false;
        debug!("Opened new session to {}", self.target);
        Ok(PooledSession::new(session, self.clone()))
    }

    async fn wait(
        self: &Arc<Self>,
        mut waiting: Waiting<'_, C>,
        cancel: Option<&CancellationToken>,
    ) -> Result<PooledSession<C>, PoolError> {
        let id = waiting.id;
        let grant = tokio::select! {
            grant = &mut waiting.rx => grant,
            _ = tokio::time::sleep(self.config.acquire_timeout) => {
                debug!("Waiter #{} for {} timed out", id, self.target.name);
                return Err(PoolError::Exhausted(self.target.name.clone()));
            }
            _ = cancelled(cancel) => {
                debug!("Waiter #{} for {} cancelled", id, self.target.name);
                return Err(PoolError::Cancelled(self.target.name.clone()));
            }
        };
        waiting.settled = true;
        drop(waiting);

        match grant {
            Ok(Grant::Session(session)) => Ok(PooledSession::new(session, self.clone())),
            Ok(Grant::Slot) => {
                let reservation = Reservation {
                    pool: self,
                    armed: true,
                };
                self.open_reserved(reservation).await
            }
            Ok(Grant::Closed) | Err(_) => Err(PoolError::Closed(self.target.name.clone())),
        }
    }

    /// Called from `Waiting::drop` when an acquire stops waiting without a grant.
    fn abandon_wait(&self, id: u64, rx: &mut oneshot::Receiver<Grant<C::Session>>) {
        let to_close = {
            let mut state = self.lock_state();
            if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                state.waiters.remove(pos);
                return;
            }
            // Already dequeued: a grant raced the timeout or cancellation.
            match rx.try_recv() {
                Ok(Grant::Session(session)) => state.check_in(session, self.config.idle_timeout),
                Ok(Grant::Slot) => {
                    state.free_slot();
                    None
                }
                Ok(Grant::Closed) | Err(_) => None,
            }
        };
        if let Some(session) = to_close {
            self.close_detached(session, "pool closed");
        }
    }

    pub(super) fn release(&self, session: C::Session) {
        let to_close = self
            .lock_state()
            .check_in(session, self.config.idle_timeout);
        match to_close {
            Some(session) => self.close_detached(session, "pool closed"),
            None => trace!("Session to {} checked in", self.target.name),
        }
    }

    pub(super) fn discard(&self, session: C::Session) {
        self.lock_state().free_slot();
        self.close_detached(session, "discarded");
    }

    /// Close idle sessions past their deadline, returns how many were closed.
    pub(super) async fn evict_idle(&self) -> usize {
        let expired = self.lock_state().take_expired(Instant::now());
        let count = expired.len();
        self.close_sessions(expired, "idle timeout").await;
        count
    }

    /// Close every idle session and fail all current and future acquires.
    pub(super) async fn shutdown(&self) -> usize {
        let idle: Vec<C::Session> = {
            let mut state = self.lock_state();
            if state.closed {
                return 0;
            }
            state.closed = true;
            while let Some(waiter) = state.waiters.pop_front() {
                let _ = waiter.tx.send(Grant::Closed);
            }
            state.idle.drain(..).map(|i| i.session).collect()
        };
        let count = idle.len();
        self.close_sessions(idle, "shutdown").await;
        count
    }

    async fn close_sessions(&self, sessions: Vec<C::Session>, reason: &str) {
        for session in sessions {
            debug!("Closing session to {} ({})", self.target.name, reason);
            if let Err(e) = session.close().await {
                warn!(
                    "Failed to close session to {} ({}): {}",
                    self.target.name, reason, e
                );
            }
        }
    }

    /// Close without blocking the caller, for paths that cannot await.
    fn close_detached(&self, session: C::Session, reason: &'static str) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // Outside a runtime the transport is just dropped.
            return;
        };
        let name = self.target.name.clone();
        runtime.spawn(async move {
            debug!("Closing session to {} ({})", name, reason);
            if let Err(e) = session.close().await {
                warn!("Failed to close session to {} ({}): {}", name, reason, e);
            }
        });
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Frees a reserved slot unless the factory call succeeds.
struct Reservation<'a, C: Connector> {
    pool: &'a SessionPool<C>,
    armed: bool,
}

impl<C: Connector> Drop for Reservation<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.lock_state().free_slot();
        }
    }
}

/// A queued acquire. Dropping it before a grant arrives deregisters it.
struct Waiting<'a, C: Connector> {
    pool: &'a SessionPool<C>,
    id: u64,
    rx: oneshot::Receiver<Grant<C::Session>>,
    settled: bool,
}

impl<C: Connector> Drop for Waiting<'_, C> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.abandon_wait(self.id, &mut self.rx);
        }
    }
}

/// An exclusively held session. Goes back to its pool when dropped.
pub struct PooledSession<C: Connector> {
    // Only `None` after release/discard consumed the handle.
    session: Option<C::Session>,
    pool: Arc<SessionPool<C>>,
}

impl<C: Connector> PooledSession<C> {
    fn new(session: C::Session, pool: Arc<SessionPool<C>>) -> Self {
        Self {
            session: Some(session),
            pool,
        }
    }

    pub fn target(&self) -> &str {
        &self.pool.target.name
    }

    /// Return the session for reuse.
    pub fn release(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }

    /// Close the session instead of reusing it, e.g. after a failed command.
    pub fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.discard(session);
        }
    }
}

impl<C: Connector> std::ops::Deref for PooledSession<C> {
    type Target = C::Session;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("session used after release")
    }
}

impl<C: Connector> std::ops::DerefMut for PooledSession<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session used after release")
    }
}

impl<C: Connector> Drop for PooledSession<C> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.release(session);
        }
    }
}
