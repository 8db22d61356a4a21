use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        Conversation, ConversationId, LocalKey, Message, Profile, UserConversation, UserId,
    },
    protocol::{MessageEvent, TypingActivity, TypingIndicator},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

pub mod directory;
pub mod error;
pub mod reconciler;
pub mod typing;

pub use directory::ParticipantDirectory;
pub use error::{EngineError, ReconcileError};
pub use reconciler::MessageReconciler;
pub use typing::{TypingIndicatorTracker, TypingTransition};

/// Tunables for one conversation's engine instance.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    /// Messages requested per historical page.
    pub fetch_page_size: u32,
    /// How long the typing prompt stays up without a fresh event.
    pub typing_hide_delay: Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            fetch_page_size: 25,
            typing_hide_delay: Duration::from_secs(5),
        }
    }
}

/// Realtime push channel scoped to one conversation. Subscriptions are
/// broadcast receivers; dropping the receiver (or the task draining it)
/// is the unsubscribe.
#[async_trait]
pub trait ConversationChannel: Send + Sync {
    fn subscribe_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> broadcast::Receiver<MessageEvent>;
    fn subscribe_typing(
        &self,
        conversation_id: &ConversationId,
    ) -> broadcast::Receiver<TypingIndicator>;
    /// Publish the local user's typing activity.
    async fn publish_typing(
        &self,
        conversation_id: &ConversationId,
        activity: TypingActivity,
    ) -> Result<()>;
}

/// Backward-paginated history fetch. Pages come back newest-first.
#[async_trait]
pub trait MessageHistorySource: Send + Sync {
    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>>;
}

/// Server-confirming message submission.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send_message(
        &self,
        message: Message,
        conversation_id: &ConversationId,
    ) -> Result<Message>;
}

/// Read-receipt delivery. Both calls are fire-and-forget from the
/// reconciler's point of view; failures are logged and never block or
/// invalidate a merge.
#[async_trait]
pub trait ReadReceiptSink: Send + Sync {
    async fn mark_read(&self, messages: Vec<Message>) -> Result<()>;
    async fn mark_last_read(
        &self,
        message: Message,
        user_conversation: UserConversation,
    ) -> Result<()>;
}

/// Drops every receipt. For hosts that do not track read state.
pub struct NullReadReceiptSink;

#[async_trait]
impl ReadReceiptSink for NullReadReceiptSink {
    async fn mark_read(&self, _messages: Vec<Message>) -> Result<()> {
        Ok(())
    }

    async fn mark_last_read(
        &self,
        _message: Message,
        _user_conversation: UserConversation,
    ) -> Result<()> {
        Ok(())
    }
}

/// Batched participant profile lookup.
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn fetch_profiles(&self, user_ids: HashSet<UserId>) -> Result<HashMap<UserId, Profile>>;
}

/// Notifications a rendering surface binds to.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The canonical sequence changed; carries a full snapshot.
    MessagesChanged(Vec<Message>),
    /// The typing prompt toggled. Edge-triggered.
    TypingChanged { visible: bool },
    /// A background operation failed with nobody left to return to.
    Error(String),
}

/// Façade and lifecycle owner for one conversation's live view.
///
/// Composes the reconciler, the typing tracker, and the participant
/// directory; owns both push subscriptions from activation to
/// deactivation. All collaborators are injected.
pub struct ConversationSyncEngine {
    config: SyncEngineConfig,
    local_user_id: UserId,
    channel: Arc<dyn ConversationChannel>,
    history: Arc<dyn MessageHistorySource>,
    sender: Arc<dyn MessageSender>,
    read_receipts: Arc<dyn ReadReceiptSink>,
    profiles: Arc<dyn ProfileSource>,
    inner: Mutex<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

struct EngineState {
    /// Bumped on every activation and deactivation so completions that
    /// outlive their activation are recognized and dropped.
    generation: u64,
    active: Option<ActiveConversation>,
}

impl EngineState {
    fn active_ref(&self, generation: u64) -> Option<&ActiveConversation> {
        if self.generation != generation {
            return None;
        }
        self.active.as_ref()
    }

    fn active_mut(&mut self, generation: u64) -> Option<&mut ActiveConversation> {
        if self.generation != generation {
            return None;
        }
        self.active.as_mut()
    }
}

struct ActiveConversation {
    conversation: Conversation,
    reconciler: MessageReconciler,
    directory: Arc<Mutex<ParticipantDirectory>>,
    typing: Arc<TypingIndicatorTracker>,
    message_task: JoinHandle<()>,
    typing_task: JoinHandle<()>,
    typing_relay_task: JoinHandle<()>,
}

impl ConversationSyncEngine {
    pub fn new(
        config: SyncEngineConfig,
        local_user_id: UserId,
        channel: Arc<dyn ConversationChannel>,
        history: Arc<dyn MessageHistorySource>,
        sender: Arc<dyn MessageSender>,
        read_receipts: Arc<dyn ReadReceiptSink>,
        profiles: Arc<dyn ProfileSource>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            config,
            local_user_id,
            channel,
            history,
            sender,
            read_receipts,
            profiles,
            inner: Mutex::new(EngineState {
                generation: 0,
                active: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Bind the engine to a conversation and start both realtime streams.
    ///
    /// The conversation may be carried by the user conversation; at least
    /// one of the two must supply it. Kicks off the initial participant
    /// resolution and the first history page in the background.
    pub async fn activate(
        self: &Arc<Self>,
        conversation: Option<Conversation>,
        user_conversation: Option<UserConversation>,
    ) -> Result<(), EngineError> {
        let user_conversation = user_conversation
            .ok_or(EngineError::InvalidState("a user conversation is required"))?;
        let conversation = conversation
            .or_else(|| user_conversation.conversation.clone())
            .ok_or(EngineError::InvalidState("no conversation to bind to"))?;

        let mut state = self.inner.lock().await;
        if state.active.is_some() {
            return Err(EngineError::InvalidState("already bound to a conversation"));
        }
        state.generation += 1;
        let generation = state.generation;

        let typing = TypingIndicatorTracker::new(self.config.typing_hide_delay);
        let message_task =
            self.spawn_message_stream(generation, self.channel.subscribe_messages(&conversation.id));
        let typing_task = self.spawn_typing_stream(
            generation,
            self.channel.subscribe_typing(&conversation.id),
            Arc::clone(&typing),
        );
        let typing_relay_task = self.spawn_typing_relay(typing.subscribe_changes());

        let participant_ids = conversation.participant_ids.clone();
        info!(conversation_id = %conversation.id, "conversation engine activated");
        state.active = Some(ActiveConversation {
            conversation,
            reconciler: MessageReconciler::new(
                user_conversation,
                Arc::clone(&self.read_receipts),
            ),
            directory: Arc::new(Mutex::new(ParticipantDirectory::new(Arc::clone(
                &self.profiles,
            )))),
            typing,
            message_task,
            typing_task,
            typing_relay_task,
        });
        drop(state);

        self.spawn_initial_participant_resolution(generation, participant_ids);
        self.spawn_initial_fetch(generation);
        Ok(())
    }

    /// Tear down subscriptions and the typing hide-timer. Idempotent;
    /// completions still in flight are dropped when they land.
    pub async fn deactivate(&self) {
        let mut state = self.inner.lock().await;
        let Some(active) = state.active.take() else {
            return;
        };
        state.generation += 1;
        drop(state);

        active.message_task.abort();
        active.typing_task.abort();
        active.typing_relay_task.abort();
        active.typing.cancel().await;
        info!(conversation_id = %active.conversation.id, "conversation engine deactivated");
    }

    /// Fetch the next older history page and merge it into the canonical
    /// sequence, returning the full resulting sequence.
    pub async fn fetch_older_messages(
        self: &Arc<Self>,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, EngineError> {
        let generation = self.current_generation().await?;
        self.fetch_older_messages_guarded(generation, before).await
    }

    /// Optimistically append a message, hand it to the send collaborator,
    /// and reconcile the confirmation. The pending entry stays in the
    /// sequence, still delivering, when the send fails.
    pub async fn send_message(
        self: &Arc<Self>,
        body: &str,
        sender_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Message, EngineError> {
        let pending = Message::pending(LocalKey::generate(), sender_id, body, now);

        let (generation, conversation_id) = {
            let mut state = self.inner.lock().await;
            let generation = state.generation;
            let active = state
                .active
                .as_mut()
                .ok_or(EngineError::InvalidState("no active conversation"))?;
            let sequence = active.reconciler.submit_pending_send(pending.clone()).to_vec();
            let conversation_id = active.conversation.id.clone();
            let _ = self.events.send(EngineEvent::MessagesChanged(sequence));
            (generation, conversation_id)
        };

        // sending a message ends the author's typing state
        self.publish_typing_best_effort(&conversation_id, TypingActivity::Finished)
            .await;

        let confirmed = self
            .sender
            .send_message(pending.clone(), &conversation_id)
            .await
            .map_err(EngineError::SendFailed)?;

        let sequence = {
            let mut state = self.inner.lock().await;
            match state.active_mut(generation) {
                Some(active) => Some(
                    match active
                        .reconciler
                        .resolve_pending_send(&pending.local_key, confirmed.clone())
                    {
                        Ok(sequence) => sequence.to_vec(),
                        Err(err @ ReconcileError::PendingNotFound { .. }) => {
                            warn!("{err}; appending the confirmation instead");
                            active.reconciler.append_confirmed(confirmed.clone()).to_vec()
                        }
                    },
                ),
                None => {
                    debug!(
                        local_key = %pending.local_key,
                        "send confirmed after deactivation; leaving engine state untouched"
                    );
                    None
                }
            }
        };
        if let Some(sequence) = sequence {
            let _ = self.events.send(EngineEvent::MessagesChanged(sequence));
        }

        Ok(confirmed)
    }

    /// Publish the local user's typing activity to the push channel.
    pub async fn publish_typing(&self, activity: TypingActivity) -> Result<(), EngineError> {
        let conversation_id = {
            let state = self.inner.lock().await;
            let active = state
                .active
                .as_ref()
                .ok_or(EngineError::InvalidState("no active conversation"))?;
            active.conversation.id.clone()
        };
        self.publish_typing_best_effort(&conversation_id, activity)
            .await;
        Ok(())
    }

    /// Snapshot of the canonical sequence, oldest first.
    pub async fn messages(&self) -> Vec<Message> {
        let state = self.inner.lock().await;
        state
            .active
            .as_ref()
            .map(|active| active.reconciler.messages().to_vec())
            .unwrap_or_default()
    }

    /// Whether the typing prompt is currently shown.
    pub async fn typing_visible(&self) -> bool {
        let typing = {
            let state = self.inner.lock().await;
            state.active.as_ref().map(|active| Arc::clone(&active.typing))
        };
        match typing {
            Some(typing) => typing.is_visible().await,
            None => false,
        }
    }

    /// The bound conversation, while active.
    pub async fn conversation(&self) -> Option<Conversation> {
        let state = self.inner.lock().await;
        state
            .active
            .as_ref()
            .map(|active| active.conversation.clone())
    }

    /// The local user's read-pointer view, while active.
    pub async fn user_conversation(&self) -> Option<UserConversation> {
        let state = self.inner.lock().await;
        state
            .active
            .as_ref()
            .map(|active| active.reconciler.user_conversation().clone())
    }

    /// Resolve a message author's cached profile for display.
    pub async fn sender_profile(&self, message: &Message) -> Option<Profile> {
        let directory = {
            let state = self.inner.lock().await;
            state
                .active
                .as_ref()
                .map(|active| Arc::clone(&active.directory))
        }?;
        let directory = directory.lock().await;
        directory.get(&message.creator_id).cloned()
    }

    async fn current_generation(&self) -> Result<u64, EngineError> {
        let state = self.inner.lock().await;
        if state.active.is_some() {
            Ok(state.generation)
        } else {
            Err(EngineError::InvalidState("no active conversation"))
        }
    }

    async fn fetch_older_messages_guarded(
        self: &Arc<Self>,
        generation: u64,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<Message>, EngineError> {
        let conversation_id = {
            let state = self.inner.lock().await;
            let active = state
                .active_ref(generation)
                .ok_or(EngineError::InvalidState("no active conversation"))?;
            active.conversation.id.clone()
        };

        let page = self
            .history
            .fetch_messages(&conversation_id, self.config.fetch_page_size, before)
            .await
            .map_err(EngineError::FetchFailed)?;

        let sequence = {
            let mut state = self.inner.lock().await;
            let Some(active) = state.active_mut(generation) else {
                debug!("dropping history page fetched across deactivation");
                return Err(EngineError::InvalidState(
                    "deactivated while fetching messages",
                ));
            };
            let is_first_page = active.reconciler.is_empty();
            active
                .reconciler
                .apply_historical_page(page, is_first_page)
                .to_vec()
        };

        let _ = self
            .events
            .send(EngineEvent::MessagesChanged(sequence.clone()));
        Ok(sequence)
    }

    async fn publish_typing_best_effort(
        &self,
        conversation_id: &ConversationId,
        activity: TypingActivity,
    ) {
        if let Err(err) = self.channel.publish_typing(conversation_id, activity).await {
            warn!(%conversation_id, "failed to publish typing activity: {err:#}");
        }
    }

    fn spawn_message_stream(
        self: &Arc<Self>,
        generation: u64,
        mut events: broadcast::Receiver<MessageEvent>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => engine.apply_message_event(generation, event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "message stream lagged; events were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    async fn apply_message_event(&self, generation: u64, event: MessageEvent) {
        let sequence = {
            let mut state = self.inner.lock().await;
            state
                .active_mut(generation)
                .map(|active| active.reconciler.apply_realtime_event(event).to_vec())
        };
        if let Some(sequence) = sequence {
            let _ = self.events.send(EngineEvent::MessagesChanged(sequence));
        }
    }

    fn spawn_typing_stream(
        self: &Arc<Self>,
        generation: u64,
        mut indicators: broadcast::Receiver<TypingIndicator>,
        typing: Arc<TypingIndicatorTracker>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match indicators.recv().await {
                    Ok(indicator) => {
                        let still_active =
                            { engine.inner.lock().await.active_ref(generation).is_some() };
                        if !still_active {
                            break;
                        }
                        let _ = typing
                            .on_indicator_event(&indicator, &engine.local_user_id)
                            .await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "typing stream lagged; snapshots were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_typing_relay(
        self: &Arc<Self>,
        mut changes: broadcast::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(visible) => {
                        let _ = engine.events.send(EngineEvent::TypingChanged { visible });
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_initial_participant_resolution(
        self: &Arc<Self>,
        generation: u64,
        participant_ids: HashSet<UserId>,
    ) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let directory = {
                let state = engine.inner.lock().await;
                match state.active_ref(generation) {
                    Some(active) => Arc::clone(&active.directory),
                    None => return,
                }
            };
            let mut directory = directory.lock().await;
            if !directory.is_empty() {
                return;
            }
            if let Err(err) = directory.resolve(&participant_ids).await {
                warn!("initial participant resolution failed: {err}");
                let _ = engine.events.send(EngineEvent::Error(format!(
                    "initial participant resolution failed: {err}"
                )));
            }
        });
    }

    fn spawn_initial_fetch(self: &Arc<Self>, generation: u64) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let sequence_empty = {
                let state = engine.inner.lock().await;
                match state.active_ref(generation) {
                    Some(active) => active.reconciler.is_empty(),
                    None => return,
                }
            };
            if !sequence_empty {
                return;
            }
            if let Err(err) = engine.fetch_older_messages_guarded(generation, None).await {
                warn!("initial message fetch failed: {err}");
                let _ = engine.events.send(EngineEvent::Error(format!(
                    "initial message fetch failed: {err}"
                )));
            }
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
