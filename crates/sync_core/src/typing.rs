use std::{sync::Arc, time::Duration};

use shared::domain::UserId;
use shared::protocol::TypingIndicator;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};

/// Outcome of feeding one presence snapshot to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingTransition {
    Shown,
    Hidden,
    Unchanged,
}

/// Debounced show/hide state machine for the "who is typing" prompt.
///
/// Every incoming snapshot restarts a single one-shot hide-timer, so the
/// prompt never outlives `hide_delay` without a fresh event. Change
/// notifications are edge-triggered: subscribers hear transitions, not
/// every event.
pub struct TypingIndicatorTracker {
    hide_delay: Duration,
    inner: Mutex<TrackerInner>,
    changes: broadcast::Sender<bool>,
}

struct TrackerInner {
    visible: bool,
    hide_timer: Option<JoinHandle<()>>,
}

impl TypingIndicatorTracker {
    pub fn new(hide_delay: Duration) -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            hide_delay,
            inner: Mutex::new(TrackerInner {
                visible: false,
                hide_timer: None,
            }),
            changes,
        })
    }

    /// Edge-triggered visibility stream.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<bool> {
        self.changes.subscribe()
    }

    pub async fn is_visible(&self) -> bool {
        self.inner.lock().await.visible
    }

    /// Apply a full typing snapshot. The local user is excluded before
    /// deciding visibility; the hide-timer restarts regardless of the
    /// outcome.
    pub async fn on_indicator_event(
        self: &Arc<Self>,
        indicator: &TypingIndicator,
        self_id: &UserId,
    ) -> TypingTransition {
        let mut inner = self.inner.lock().await;
        if let Some(timer) = inner.hide_timer.take() {
            timer.abort();
        }

        let someone_else_typing = indicator
            .typing_user_ids
            .iter()
            .any(|id| id != self_id);
        let transition = self.apply_visibility(&mut inner, someone_else_typing);

        let tracker = Arc::clone(self);
        inner.hide_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(tracker.hide_delay).await;
            tracker.hide_on_timeout().await;
        }));

        transition
    }

    /// Cancel the pending hide-timer. Called on engine deactivation.
    pub async fn cancel(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(timer) = inner.hide_timer.take() {
            timer.abort();
        }
    }

    async fn hide_on_timeout(&self) {
        let mut inner = self.inner.lock().await;
        inner.hide_timer = None;
        self.apply_visibility(&mut inner, false);
    }

    fn apply_visibility(&self, inner: &mut TrackerInner, visible: bool) -> TypingTransition {
        if inner.visible == visible {
            return TypingTransition::Unchanged;
        }
        inner.visible = visible;
        let _ = self.changes.send(visible);
        if visible {
            TypingTransition::Shown
        } else {
            TypingTransition::Hidden
        }
    }
}
