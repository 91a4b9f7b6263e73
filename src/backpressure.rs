//! Bounded FIFO queue with watermark hysteresis and overflow strategies.
//!
//! Pressure is entered at the high watermark and left only at the low
//! watermark, so a queue hovering near the boundary cannot flap. Overflow
//! behavior is pluggable: reject the newcomer, evict the oldest, or park
//! the producer until the queue relieves.

use crate::error::ReliabilityError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// What happens to a push when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowStrategy {
    /// Reject the incoming item.
    DropNewest,
    /// Evict the queue head to make room.
    DropOldest,
    /// Park the producer until the queue relieves.
    Block,
}

/// Queue tuning. Invariant: `0 <= low_water < high_water <= max_size`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    pub high_water: usize,
    pub low_water: usize,
    pub max_size: usize,
    pub strategy: OverflowStrategy,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            high_water: 800,
            low_water: 200,
            max_size: 1_600,
            strategy: OverflowStrategy::DropNewest,
        }
    }
}

/// Rejected configurations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackpressureConfigError {
    #[error("low watermark {low} must be below high watermark {high}")]
    WatermarksInverted { low: usize, high: usize },
    #[error("high watermark {high} must not exceed max size {max}")]
    HighAboveMax { high: usize, max: usize },
    #[error("max size must be greater than zero")]
    ZeroCapacity,
}

impl BackpressureConfig {
    pub fn validate(&self) -> Result<(), BackpressureConfigError> {
        if self.max_size == 0 {
            return Err(BackpressureConfigError::ZeroCapacity);
        }
        if self.low_water >= self.high_water {
            return Err(BackpressureConfigError::WatermarksInverted {
                low: self.low_water,
                high: self.high_water,
            });
        }
        if self.high_water > self.max_size {
            return Err(BackpressureConfigError::HighAboveMax {
                high: self.high_water,
                max: self.max_size,
            });
        }
        Ok(())
    }
}

/// Snapshot reported by [`BackpressureManager::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub high_water: usize,
    pub low_water: usize,
    pub strategy: OverflowStrategy,
    pub dropped: u64,
    pub under_pressure: bool,
}

type PressureHook = Arc<dyn Fn(f64) + Send + Sync>;
type ReliefHook = Arc<dyn Fn() + Send + Sync>;

struct QueueState<T> {
    items: VecDeque<T>,
    dropped: u64,
    under_pressure: bool,
    closed: bool,
}

enum Edge {
    Pressure(f64),
    Relief,
    None,
}

/// Outcome of a single locked attempt to pop, returned by `poll_pop` so the
/// `MutexGuard` stays confined to that non-async function.
enum PopOutcome<'a, T> {
    Item(T, Edge),
    Closed,
    Wait(std::pin::Pin<Box<tokio::sync::futures::Notified<'a>>>),
}

/// Outcome of a single locked attempt to push, returned by `poll_push` so
/// the `MutexGuard` stays confined to that non-async function.
enum PushOutcome<'a> {
    Enqueued(Edge),
    Rejected,
    Closed,
    Wait(std::pin::Pin<Box<tokio::sync::futures::Notified<'a>>>),
}

/// Bounded queue that pushes back on producers.
pub struct BackpressureManager<T> {
    config: BackpressureConfig,
    state: Mutex<QueueState<T>>,
    items_available: Notify,
    space_available: Notify,
    on_pressure: Option<PressureHook>,
    on_relief: Option<ReliefHook>,
}

impl<T: Send> BackpressureManager<T> {
    pub fn new(config: BackpressureConfig) -> Result<Self, BackpressureConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                dropped: 0,
                under_pressure: false,
                closed: false,
            }),
            items_available: Notify::new(),
            space_available: Notify::new(),
            on_pressure: None,
            on_relief: None,
        })
    }

    /// Observe pressure/relief edges. Hooks run after the queue lock is
    /// released and must not block.
    pub fn with_hooks(
        mut self,
        on_pressure: impl Fn(f64) + Send + Sync + 'static,
        on_relief: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        self.on_pressure = Some(Arc::new(on_pressure));
        self.on_relief = Some(Arc::new(on_relief));
        self
    }

    /// Lock, try to enqueue, and either produce the result or a registered
    /// wait future — kept out of `push`'s async body so the `MutexGuard`
    /// never becomes part of that future's state (it isn't `Send`).
    fn poll_push(&self, slot: &mut Option<T>) -> PushOutcome<'_> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.closed {
            return PushOutcome::Closed;
        }

        if state.items.len() < self.config.max_size {
            if let Some(value) = slot.take() {
                state.items.push_back(value);
            }
            let edge = self.pressure_edge(&mut state);
            return PushOutcome::Enqueued(edge);
        }

        match self.config.strategy {
            OverflowStrategy::DropNewest => {
                state.dropped += 1;
                tracing::trace!(dropped = state.dropped, "queue full, rejecting newest");
                PushOutcome::Rejected
            }
            OverflowStrategy::DropOldest => {
                state.items.pop_front();
                state.dropped += 1;
                if let Some(value) = slot.take() {
                    state.items.push_back(value);
                }
                let edge = self.pressure_edge(&mut state);
                PushOutcome::Enqueued(edge)
            }
            OverflowStrategy::Block => {
                // Park until relief fires, then re-check from the top.
                let mut parked = Box::pin(self.space_available.notified());
                parked.as_mut().enable();
                PushOutcome::Wait(parked)
            }
        }
    }

    /// Enqueue `item`. Returns `Ok(false)` when the item was rejected by the
    /// `DropNewest` strategy; under `Block` the future parks until the queue
    /// relieves or is closed.
    pub async fn push(&self, item: T) -> Result<bool, ReliabilityError<std::convert::Infallible>> {
        let mut slot = Some(item);
        loop {
            match self.poll_push(&mut slot) {
                PushOutcome::Enqueued(edge) => {
                    self.items_available.notify_waiters();
                    self.fire(edge);
                    return Ok(true);
                }
                PushOutcome::Rejected => return Ok(false),
                PushOutcome::Closed => return Err(ReliabilityError::Shutdown),
                PushOutcome::Wait(parked) => parked.await,
            }
        }
    }

    /// Lock, try to pop, and either produce the result or a registered
    /// wait future — kept out of `pop`'s async body so the `MutexGuard`
    /// never becomes part of that future's state (it isn't `Send`).
    fn poll_pop(&self) -> PopOutcome<'_, T> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.items.pop_front() {
            Some(popped) => {
                let edge = self.relief_edge(&mut state);
                if !state.items.is_empty() {
                    self.items_available.notify_one();
                }
                PopOutcome::Item(popped, edge)
            }
            None => {
                if state.closed {
                    return PopOutcome::Closed;
                }
                let mut waiting = Box::pin(self.items_available.notified());
                waiting.as_mut().enable();
                PopOutcome::Wait(waiting)
            }
        }
    }

    /// Dequeue one item, waiting while the queue is empty. Fails with
    /// `Shutdown` once the queue is closed and drained.
    pub async fn pop(&self) -> Result<T, ReliabilityError<std::convert::Infallible>> {
        loop {
            match self.poll_pop() {
                PopOutcome::Item(item, edge) => {
                    self.fire(edge);
                    return Ok(item);
                }
                PopOutcome::Closed => return Err(ReliabilityError::Shutdown),
                PopOutcome::Wait(waiting) => waiting.await,
            }
        }
    }

    /// Atomically empty the queue and reset the dropped counter.
    pub fn drain(&self) -> Vec<T> {
        let edge;
        let drained;
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            drained = state.items.drain(..).collect();
            state.dropped = 0;
            edge = self.relief_edge(&mut state);
        }
        self.fire(edge);
        drained
    }

    /// Close the queue: pending and future pushes fail with `Shutdown`,
    /// consumers drain what remains and then fail.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            state.closed = true;
        }
        self.items_available.notify_waiters();
        self.space_available.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn under_pressure(&self) -> bool {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).under_pressure
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        QueueStats {
            size: state.items.len(),
            max_size: self.config.max_size,
            high_water: self.config.high_water,
            low_water: self.config.low_water,
            strategy: self.config.strategy,
            dropped: state.dropped,
            under_pressure: state.under_pressure,
        }
    }

    fn pressure_edge(&self, state: &mut QueueState<T>) -> Edge {
        if state.items.len() >= self.config.high_water && !state.under_pressure {
            state.under_pressure = true;
            let level = state.items.len() as f64 / self.config.max_size as f64;
            tracing::warn!(size = state.items.len(), level, "queue under pressure");
            return Edge::Pressure(level);
        }
        Edge::None
    }

    fn relief_edge(&self, state: &mut QueueState<T>) -> Edge {
        if state.under_pressure && state.items.len() <= self.config.low_water {
            state.under_pressure = false;
            tracing::info!(size = state.items.len(), "queue pressure relieved");
            self.space_available.notify_waiters();
            return Edge::Relief;
        }
        Edge::None
    }

    fn fire(&self, edge: Edge) {
        match edge {
            Edge::Pressure(level) => {
                if let Some(hook) = &self.on_pressure {
                    hook(level);
                }
            }
            Edge::Relief => {
                if let Some(hook) = &self.on_relief {
                    hook();
                }
            }
            Edge::None => {}
        }
    }
}
