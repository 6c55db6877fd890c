use std::sync::{Arc, Mutex as SyncMutex};

use async_trait::async_trait;
use shared::domain::ConversationId;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, warn};

use crate::{
    error::PaginationError,
    messages::{LoadOutcome, MessageStream, StreamEvent},
};

/// Geometry snapshot of the message viewport, in logical pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMetrics {
    pub content_height: f64,
    pub scroll_offset: f64,
    pub viewport_height: f64,
}

impl ViewportMetrics {
    /// Distance between the bottom edge of the viewport and the bottom of
    /// the content.
    pub fn distance_from_bottom(&self) -> f64 {
        (self.content_height - self.scroll_offset - self.viewport_height).max(0.0)
    }
}

/// Rendering-side seam. Implementations report geometry and accept direct
/// scroll writes; `layout_settled` resolves once the latest content changes
/// have been laid out and measuring is meaningful again.
#[async_trait]
pub trait Viewport: Send + Sync {
    async fn metrics(&self) -> ViewportMetrics;
    async fn set_scroll_offset(&self, offset: f64);
    async fn layout_settled(&self);
}

/// Null object for headless contexts.
pub struct MissingViewport;

#[async_trait]
impl Viewport for MissingViewport {
    async fn metrics(&self) -> ViewportMetrics {
        ViewportMetrics {
            content_height: 0.0,
            scroll_offset: 0.0,
            viewport_height: 0.0,
        }
    }

    async fn set_scroll_offset(&self, _offset: f64) {}

    async fn layout_settled(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RestorePhase {
    Idle,
    /// Pre-pagination geometry captured, waiting for the fetch and the
    /// first layout pass.
    Measuring,
    /// First offset correction written, waiting for one more layout pass in
    /// case late measurement shifts the content again.
    Corrected,
    Settled,
}

#[derive(Debug, Clone)]
struct ScrollAnchor {
    conversation_id: ConversationId,
    content_height: f64,
    scroll_offset: f64,
    /// Window length at capture time; pagination that leaves it unchanged
    /// has nothing to restore.
    message_count: usize,
}

struct AnchorState {
    phase: RestorePhase,
    anchor: Option<ScrollAnchor>,
    active: Option<ConversationId>,
    /// Tracked from user scrolls; decides whether appended messages pull
    /// the view down.
    near_bottom: bool,
}

/// Keeps the viewport stable across history pagination and follows the tail
/// for new messages. Pagination for the active conversation goes through
/// [`ScrollAnchorController::paginate`] so geometry is captured before the
/// fetch mutates the window.
pub struct ScrollAnchorController {
    stream: Arc<MessageStream>,
    viewport: Arc<dyn Viewport>,
    near_bottom_threshold: f64,
    inner: Mutex<AnchorState>,
    listener: SyncMutex<Option<JoinHandle<()>>>,
}

impl ScrollAnchorController {
    pub fn new(
        stream: Arc<MessageStream>,
        viewport: Arc<dyn Viewport>,
        near_bottom_threshold: f64,
    ) -> Arc<Self> {
        let controller = Arc::new(Self {
            stream,
            viewport,
            near_bottom_threshold,
            inner: Mutex::new(AnchorState {
                phase: RestorePhase::Idle,
                anchor: None,
                active: None,
                near_bottom: true,
            }),
            listener: SyncMutex::new(None),
        });
        controller.spawn_listener();
        controller
    }

    /// Switches the controller to another conversation. Any in-flight
    /// restoration is discarded unconditionally; stale anchors must never
    /// survive a switch.
    pub async fn set_active_conversation(&self, conversation_id: Option<ConversationId>) {
        let mut guard = self.inner.lock().await;
        guard.active = conversation_id;
        guard.anchor = None;
        guard.phase = RestorePhase::Idle;
        guard.near_bottom = true;
    }

    /// Records a user scroll so tail-follow can be decided later without
    /// another geometry read.
    pub async fn note_user_scroll(&self) {
        let metrics = self.viewport.metrics().await;
        let mut guard = self.inner.lock().await;
        guard.near_bottom = metrics.distance_from_bottom() <= self.near_bottom_threshold;
    }

    pub async fn scroll_to_bottom(&self) {
        let metrics = self.viewport.metrics().await;
        self.viewport
            .set_scroll_offset((metrics.content_height - metrics.viewport_height).max(0.0))
            .await;
        self.inner.lock().await.near_bottom = true;
    }

    /// Loads one older page for the active conversation and restores the
    /// scroll position so the previously-top message stays put. No-ops while
    /// a restoration is still pending.
    pub async fn paginate(&self) -> Result<LoadOutcome, PaginationError> {
        let (conversation_id, captured_count) = {
            let mut guard = self.inner.lock().await;
            let Some(conversation_id) = guard.active.clone() else {
                return Ok(LoadOutcome::Skipped);
            };
            if guard.phase != RestorePhase::Idle {
                debug!("scroll: pagination skipped, restoration still in flight");
                return Ok(LoadOutcome::Skipped);
            }
            let metrics = self.viewport.metrics().await;
            let message_count = self.stream.window_len(&conversation_id).await;
            guard.anchor = Some(ScrollAnchor {
                conversation_id: conversation_id.clone(),
                content_height: metrics.content_height,
                scroll_offset: metrics.scroll_offset,
                message_count,
            });
            guard.phase = RestorePhase::Measuring;
            (conversation_id, message_count)
        };

        let outcome = match self.stream.load_more(&conversation_id).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.clear_anchor().await;
                return Err(err);
            }
        };
        let nothing_prepended = match outcome {
            LoadOutcome::Skipped => true,
            LoadOutcome::Loaded { prepended } => {
                prepended == 0 || self.stream.window_len(&conversation_id).await == captured_count
            }
        };
        if nothing_prepended {
            // Nothing above the anchor moved, so there is nothing to restore.
            self.clear_anchor().await;
            return Ok(outcome);
        }

        self.viewport.layout_settled().await;
        let Some(anchor) = self.take_anchor_if_current(&conversation_id).await else {
            return Ok(outcome);
        };

        let metrics = self.viewport.metrics().await;
        let corrected = anchor.scroll_offset + (metrics.content_height - anchor.content_height);
        self.viewport.set_scroll_offset(corrected.max(0.0)).await;
        self.set_phase(RestorePhase::Corrected).await;

        // Late measurements (images, fonts) can shift the content after the
        // first correction.
        self.viewport.layout_settled().await;
        if self.active_is(&conversation_id).await {
            let settled = self.viewport.metrics().await;
            if settled.content_height != metrics.content_height {
                let shifted = corrected + (settled.content_height - metrics.content_height);
                self.viewport.set_scroll_offset(shifted.max(0.0)).await;
            }
        }
        self.set_phase(RestorePhase::Settled).await;
        self.set_phase(RestorePhase::Idle).await;
        Ok(outcome)
    }

    /// Routes message stream events into scroll behavior: initial load jumps
    /// to the bottom, tail appends follow only when the user was already
    /// near it.
    async fn handle_stream_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::InitialLoaded {
                conversation_id, ..
            } => {
                if self.active_is(&conversation_id).await {
                    self.viewport.layout_settled().await;
                    self.scroll_to_bottom().await;
                }
            }
            StreamEvent::MessageAppended {
                conversation_id,
                at_tail: true,
                ..
            } => {
                let follow = {
                    let guard = self.inner.lock().await;
                    guard.active.as_ref() == Some(&conversation_id)
                        && guard.near_bottom
                        && guard.phase == RestorePhase::Idle
                };
                if follow {
                    self.viewport.layout_settled().await;
                    self.scroll_to_bottom().await;
                }
            }
            StreamEvent::MessageAppended { at_tail: false, .. }
            | StreamEvent::PageLoaded { .. }
            | StreamEvent::DeliveryUpdated { .. } => {}
        }
    }

    fn spawn_listener(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        let mut events = self.stream.subscribe_events();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => controller.handle_stream_event(event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "scroll: event listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
    }

    pub async fn shutdown(&self) {
        let task = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    async fn active_is(&self, conversation_id: &ConversationId) -> bool {
        self.inner.lock().await.active.as_ref() == Some(conversation_id)
    }

    /// Takes the anchor only if the conversation is still active and the
    /// anchor still belongs to it; otherwise the restoration is abandoned.
    async fn take_anchor_if_current(
        &self,
        conversation_id: &ConversationId,
    ) -> Option<ScrollAnchor> {
        let mut guard = self.inner.lock().await;
        let still_current = guard.active.as_ref() == Some(conversation_id)
            && guard
                .anchor
                .as_ref()
                .is_some_and(|a| &a.conversation_id == conversation_id);
        if !still_current {
            guard.anchor = None;
            guard.phase = RestorePhase::Idle;
            return None;
        }
        guard.anchor.take()
    }

    async fn clear_anchor(&self) {
        let mut guard = self.inner.lock().await;
        guard.anchor = None;
        guard.phase = RestorePhase::Idle;
    }

    async fn set_phase(&self, phase: RestorePhase) {
        self.inner.lock().await.phase = phase;
    }
}

#[cfg(test)]
#[path = "tests/scroll_tests.rs"]
mod tests;
