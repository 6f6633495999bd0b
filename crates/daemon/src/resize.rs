//! Resize coordination.
//!
//! The multiplexer keeps one canonical size per session, shared by every
//! viewer, while each client has its own viewport. This module decides which
//! viewport changes reach the multiplexer and drives the redraw needed when a
//! client reattaches.
//!
//! Each session has a lane with a small state machine (`Idle -> Resizing ->
//! Idle`). Transitions on one lane are strictly sequential. While a lane is
//! `Resizing`, output from the multiplexer is held back and thrown away when
//! the transition ends, since it was rendered for the old size.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use protocol::messages::SessionRef;
use protocol::{Dimensions, ResizeKind, ServerMessage};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::EngineError;
use crate::mux::{MuxHandle, Multiplexer};
use crate::ownership::OwnershipRouter;
use crate::session::{SessionId, SessionStore};

/// Timing and threshold knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSettings {
    /// Window resizes arriving within this interval collapse into one.
    pub debounce: Duration,
    /// Reconnection redraws for one session are at least this far apart.
    pub reconnect_debounce: Duration,
    /// Column changes larger than this blank the client buffer first.
    pub clear_threshold_cols: u16,
    /// Pause between the two steps of the redraw trick.
    pub trick_settle: Duration,
}

impl Default for ResizeSettings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            reconnect_debounce: Duration::from_millis(500),
            clear_threshold_cols: 5,
            trick_settle: Duration::from_millis(50),
        }
    }
}

/// Lane state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizePhase {
    Idle,
    Resizing,
}

/// What a resize request turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeOutcome {
    /// Client-side fit only; nothing forwarded.
    LocalOnly,
    /// A debounced window resize is pending.
    Scheduled,
    /// The multiplexer took the new size. `cleared` tells whether owners were
    /// told to blank their buffers first.
    Applied { cleared: bool },
    /// The two-step redraw was issued.
    Redrawn,
    /// Nothing to do: the multiplexer already has this size.
    Unchanged,
    /// A redraw ran too recently for this session.
    Suppressed,
}

struct PendingResize {
    generation: u64,
    task: JoinHandle<()>,
}

struct LaneState {
    phase: ResizePhase,
    queued: Vec<Bytes>,
    pending: Option<PendingResize>,
    generation: u64,
    last_redraw: Option<Instant>,
}

/// Per-session resize state.
struct ResizeLane {
    state: Mutex<LaneState>,
    /// Held while an output chunk is flushed to clients.
    flush: tokio::sync::Mutex<()>,
    /// Held for the whole of a resize transition.
    transition: tokio::sync::Mutex<()>,
}

impl ResizeLane {
    fn new() -> Self {
        Self {
            state: Mutex::new(LaneState {
                phase: ResizePhase::Idle,
                queued: Vec::new(),
                pending: None,
                generation: 0,
                last_redraw: None,
            }),
            flush: tokio::sync::Mutex::new(()),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enters `Resizing` once any in-progress flush has finished.
    async fn begin<'a>(&'a self, session_id: &'a str) -> Transition<'a> {
        let _flush = self.flush.lock().await;
        self.state().phase = ResizePhase::Resizing;
        Transition {
            lane: self,
            session_id,
        }
    }
}

/// Returns the lane to `Idle` when dropped, discarding held output.
struct Transition<'a> {
    lane: &'a ResizeLane,
    session_id: &'a str,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        let mut state = self.lane.state();
        state.phase = ResizePhase::Idle;
        let discarded = std::mem::take(&mut state.queued);
        if !discarded.is_empty() {
            tracing::debug!(
                session_id = %self.session_id,
                chunks = discarded.len(),
                bytes = discarded.iter().map(Bytes::len).sum::<usize>(),
                "Discarded output produced during resize"
            );
        }
    }
}

/// Coordinates viewport changes with the multiplexer.
pub struct ResizeCoordinator<M: Multiplexer> {
    store: Arc<SessionStore>,
    mux: Arc<M>,
    router: Arc<OwnershipRouter<M>>,
    lanes: DashMap<SessionId, Arc<ResizeLane>>,
    settings: ResizeSettings,
}

impl<M: Multiplexer> ResizeCoordinator<M> {
    pub fn new(
        store: Arc<SessionStore>,
        mux: Arc<M>,
        router: Arc<OwnershipRouter<M>>,
        settings: ResizeSettings,
    ) -> Self {
        Self {
            store,
            mux,
            router,
            lanes: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &ResizeSettings {
        &self.settings
    }

    fn lane(&self, session_id: &str) -> Arc<ResizeLane> {
        Arc::clone(
            self.lanes
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(ResizeLane::new()))
                .value(),
        )
    }

    /// Current phase of a session's lane.
    pub fn phase(&self, session_id: &str) -> ResizePhase {
        self.lanes
            .get(session_id)
            .map(|lane| lane.state().phase)
            .unwrap_or(ResizePhase::Idle)
    }

    /// Whether a debounced resize is waiting to fire.
    pub fn has_pending(&self, session_id: &str) -> bool {
        self.lanes
            .get(session_id)
            .map(|lane| lane.state().pending.is_some())
            .unwrap_or(false)
    }

    /// Handles a client viewport change.
    ///
    /// Layout changes stay on the client. Window resizes are debounced; a new
    /// one replaces the pending one instead of stacking behind it.
    pub fn handle_resize(
        self: &Arc<Self>,
        session_id: &str,
        dims: Dimensions,
        kind: ResizeKind,
    ) -> Result<ResizeOutcome, EngineError> {
        if !self.store.contains(session_id) {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }

        match kind {
            ResizeKind::Layout => {
                tracing::trace!(session_id = %session_id, %dims, "Layout resize kept client-side");
                Ok(ResizeOutcome::LocalOnly)
            }
            ResizeKind::Window => {
                self.schedule(session_id, dims);
                Ok(ResizeOutcome::Scheduled)
            }
        }
    }

    fn schedule(self: &Arc<Self>, session_id: &str, dims: Dimensions) {
        let lane = self.lane(session_id);
        let mut state = lane.state();
        state.generation += 1;
        let generation = state.generation;

        if let Some(previous) = state.pending.take() {
            previous.task.abort();
            tracing::trace!(session_id = %session_id, "Replaced pending window resize");
        }

        let coordinator = Arc::clone(self);
        let task_lane = Arc::clone(&lane);
        let id = session_id.to_string();
        let task = tokio::spawn(async move {
            tokio::time::sleep(coordinator.settings.debounce).await;

            // Once claimed, the task can no longer be replaced.
            {
                let mut state = task_lane.state();
                match &state.pending {
                    Some(pending) if pending.generation == generation => {
                        state.pending = None;
                    }
                    _ => return,
                }
            }

            match coordinator.apply_window_resize(&id, dims).await {
                Ok(outcome) => {
                    tracing::debug!(session_id = %id, %dims, ?outcome, "Window resize applied");
                }
                Err(e) => {
                    tracing::warn!(session_id = %id, %dims, error = %e, "Window resize failed");
                }
            }
        });

        state.pending = Some(PendingResize { generation, task });
    }

    /// Cancels a pending debounced resize. Safe to call repeatedly.
    pub fn cancel_pending(&self, session_id: &str) -> bool {
        let Some(lane) = self.lanes.get(session_id).map(|l| Arc::clone(l.value())) else {
            return false;
        };
        let pending = lane.state().pending.take();
        match pending {
            Some(pending) => {
                pending.task.abort();
                tracing::trace!(session_id = %session_id, "Cancelled pending window resize");
                true
            }
            None => false,
        }
    }

    /// Drops all resize state for a session.
    pub fn forget(&self, session_id: &str) {
        self.cancel_pending(session_id);
        self.lanes.remove(session_id);
    }

    /// Forwards a final window size to the multiplexer.
    ///
    /// Owners are told to blank their buffers first when the column change
    /// exceeds the threshold. If the multiplexer ignores the call although
    /// its size differs from the request, the redraw trick is used instead.
    pub async fn apply_window_resize(
        &self,
        session_id: &str,
        dims: Dimensions,
    ) -> Result<ResizeOutcome, EngineError> {
        let lane = self.lane(session_id);
        let _transition = lane.transition.lock().await;

        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;
        let Some(handle) = self.router.handle(session_id) else {
            tracing::debug!(session_id = %session_id, "No attachment; window resize not forwarded");
            return Ok(ResizeOutcome::LocalOnly);
        };

        let _resizing = lane.begin(session_id).await;

        let cleared = record.dimensions.col_delta(&dims) > self.settings.clear_threshold_cols;
        if cleared {
            self.router
                .notify_owners(
                    session_id,
                    ServerMessage::ClearBuffer(SessionRef {
                        id: session_id.to_string(),
                    }),
                )
                .await;
        }

        let outcome = if self.mux.resize(&handle, dims).await? {
            ResizeOutcome::Applied { cleared }
        } else if record.dimensions != dims {
            let ignored = EngineError::ResizeIgnored(session_id.to_string());
            tracing::debug!(session_id = %session_id, reason = %ignored, "Falling back to redraw");
            self.redraw(&handle, dims).await?;
            ResizeOutcome::Redrawn
        } else {
            ResizeOutcome::Unchanged
        };

        self.store
            .mutate(session_id, |r| r.dimensions = dims)
            .await?;

        tracing::info!(
            session_id = %session_id,
            cols = dims.cols,
            rows = dims.rows,
            cleared,
            "Session resized"
        );
        Ok(outcome)
    }

    /// Brings the multiplexer to the reattaching client's fit and makes sure
    /// it redraws.
    ///
    /// When the stored size already equals the fit, a plain resize would be
    /// ignored, so the session is shrunk by one row and restored. Repeated
    /// redraws within the reconnection debounce are suppressed.
    pub async fn reconnect(
        &self,
        session_id: &str,
        fit: Dimensions,
    ) -> Result<ResizeOutcome, EngineError> {
        let lane = self.lane(session_id);
        let handle = self
            .router
            .handle(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;

        {
            let mut state = lane.state();
            let now = Instant::now();
            if let Some(last) = state.last_redraw {
                if now.duration_since(last) < self.settings.reconnect_debounce {
                    tracing::debug!(session_id = %session_id, "Reconnection redraw suppressed");
                    return Ok(ResizeOutcome::Suppressed);
                }
            }
            state.last_redraw = Some(now);
        }

        let _transition = lane.transition.lock().await;
        let record = self
            .store
            .get(session_id)
            .await
            .map_err(|e| EngineError::from_lookup(session_id, e))?;
        let _resizing = lane.begin(session_id).await;

        let outcome = if record.dimensions == fit {
            self.redraw(&handle, fit).await?;
            ResizeOutcome::Redrawn
        } else if self.mux.resize(&handle, fit).await? {
            ResizeOutcome::Applied { cleared: false }
        } else {
            self.redraw(&handle, fit).await?;
            ResizeOutcome::Redrawn
        };

        self.store
            .mutate(session_id, |r| r.dimensions = fit)
            .await?;

        tracing::info!(session_id = %session_id, %fit, ?outcome, "Reconnection resize");
        Ok(outcome)
    }

    /// Shrinks by one row, waits, then restores `fit`.
    ///
    /// Rows are used rather than columns so a status line never wraps. A
    /// one-row terminal grows by one row instead.
    async fn redraw(&self, handle: &MuxHandle, fit: Dimensions) -> Result<(), EngineError> {
        let step = if fit.rows > 1 {
            Dimensions::new(fit.cols, fit.rows - 1)
        } else {
            Dimensions::new(fit.cols, fit.rows + 1)
        };
        self.mux.resize(handle, step).await?;
        tokio::time::sleep(self.settings.trick_settle).await;
        self.mux.resize(handle, fit).await?;
        Ok(())
    }

    /// Passes an output chunk to the session's owners.
    ///
    /// Chunks arriving while the lane is `Resizing` are held and later
    /// discarded. Returns the number of connections the chunk reached.
    pub async fn deliver_output(&self, session_id: &str, data: Bytes) -> usize {
        let lane = self.lane(session_id);
        let _flush = lane.flush.lock().await;
        {
            let mut state = lane.state();
            if state.phase == ResizePhase::Resizing {
                state.queued.push(data);
                return 0;
            }
        }
        self.router.route_output(session_id, &data).await
    }
}
