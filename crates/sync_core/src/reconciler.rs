use std::sync::Arc;

use shared::domain::{LocalKey, Message, MessageId, UserConversation};
use shared::protocol::MessageEvent;
use tracing::warn;

use crate::{error::ReconcileError, ReadReceiptSink};

/// Ordered merge engine for one conversation's message list.
///
/// The sequence carries no independent sort key: historical pages are
/// prepended, everything else is appended or replaced in place. Pages
/// arrive strictly older than anything already held, and realtime events
/// arrive current-or-future, so insertion position tracks chronology.
/// Out-of-order realtime delivery is not corrected.
pub struct MessageReconciler {
    messages: Vec<Message>,
    user_conversation: UserConversation,
    read_receipts: Arc<dyn ReadReceiptSink>,
}

impl MessageReconciler {
    pub fn new(user_conversation: UserConversation, read_receipts: Arc<dyn ReadReceiptSink>) -> Self {
        Self {
            messages: Vec::new(),
            user_conversation,
            read_receipts,
        }
    }

    /// The canonical sequence, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn user_conversation(&self) -> &UserConversation {
        &self.user_conversation
    }

    /// Merge a page returned newest-first by the history source.
    ///
    /// The page is reversed to chronological order and prepended. A first
    /// non-empty page marks its messages read, exactly once; later pages
    /// never do.
    pub fn apply_historical_page(&mut self, page: Vec<Message>, is_first_page: bool) -> &[Message] {
        if is_first_page && !page.is_empty() {
            // newest-first page: the head is the read-pointer target
            self.mark_read(page.clone(), page[0].clone());
        }

        let mut merged: Vec<Message> = page.into_iter().rev().collect();
        merged.append(&mut self.messages);
        self.messages = merged;
        &self.messages
    }

    /// Apply one realtime event from the push channel.
    ///
    /// Events are not assumed ordered relative to historical pages;
    /// matching by id at apply time makes re-delivered creates idempotent.
    pub fn apply_realtime_event(&mut self, event: MessageEvent) -> &[Message] {
        match event {
            MessageEvent::Created { message } => self.apply_created(message),
            MessageEvent::Updated { message } => self.apply_updated(message),
            MessageEvent::Deleted { message } => self.apply_deleted(message),
        }
        &self.messages
    }

    /// Append a locally-created message awaiting confirmation.
    pub fn submit_pending_send(&mut self, message: Message) -> &[Message] {
        self.messages.push(message);
        &self.messages
    }

    /// Replace the pending entry for `local_key` with its confirmation.
    ///
    /// Leaves the sequence untouched when no pending entry matches; the
    /// caller decides what to do with the confirmation in that case.
    pub fn resolve_pending_send(
        &mut self,
        local_key: &LocalKey,
        confirmed: Message,
    ) -> Result<&[Message], ReconcileError> {
        match self.position_of_pending(local_key) {
            Some(idx) => {
                self.messages[idx] = confirmed;
                Ok(&self.messages)
            }
            None => Err(ReconcileError::PendingNotFound {
                local_key: local_key.clone(),
            }),
        }
    }

    /// Append a confirmation whose pending entry is already gone.
    pub fn append_confirmed(&mut self, confirmed: Message) -> &[Message] {
        self.messages.push(confirmed);
        &self.messages
    }

    fn apply_created(&mut self, mut message: Message) {
        match self.position_by_id(message.id.as_ref()) {
            // re-delivered create: replace in place
            Some(idx) => {
                message.delivery_status = self.messages[idx]
                    .delivery_status
                    .max(message.delivery_status);
                self.messages[idx] = message.clone();
            }
            None => self.messages.push(message.clone()),
        }
        self.mark_read(vec![message.clone()], message);
    }

    fn apply_updated(&mut self, mut message: Message) {
        match self.position_of(&message) {
            Some(idx) => {
                if !self.messages[idx].is_pending() {
                    message.delivery_status = self.messages[idx]
                        .delivery_status
                        .max(message.delivery_status);
                }
                self.messages[idx] = message;
            }
            None => warn!(
                message_id = ?message.id,
                "update for a message that is not in the sequence"
            ),
        }
    }

    fn apply_deleted(&mut self, message: Message) {
        match self.position_of(&message) {
            Some(idx) => {
                self.messages.remove(idx);
            }
            None => warn!(
                message_id = ?message.id,
                "delete for a message that is not in the sequence"
            ),
        }
    }

    fn position_by_id(&self, id: Option<&MessageId>) -> Option<usize> {
        let id = id?;
        self.messages.iter().position(|m| m.id.as_ref() == Some(id))
    }

    /// Id match first; a pending entry with the same local key matches as
    /// a fallback, so deletes and updates can reach not-yet-confirmed
    /// messages.
    fn position_of(&self, message: &Message) -> Option<usize> {
        if let Some(idx) = self.position_by_id(message.id.as_ref()) {
            return Some(idx);
        }
        self.position_of_pending(&message.local_key)
    }

    fn position_of_pending(&self, local_key: &LocalKey) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| m.is_pending() && &m.local_key == local_key)
    }

    /// Advance the read pointer and hand the receipts to the sink without
    /// waiting on it. Receipt failures are logged, never propagated.
    fn mark_read(&mut self, messages: Vec<Message>, last_read: Message) {
        if last_read.id.is_some() {
            self.user_conversation.last_read_message_id = last_read.id.clone();
        }

        let sink = Arc::clone(&self.read_receipts);
        let user_conversation = self.user_conversation.clone();
        tokio::spawn(async move {
            if let Err(err) = sink.mark_read(messages).await {
                warn!("failed to mark messages read: {err:#}");
            }
            if let Err(err) = sink.mark_last_read(last_read, user_conversation).await {
                warn!("failed to advance the last-read pointer: {err:#}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use shared::domain::{DeliveryStatus, UserId};
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        marked: Arc<Mutex<Vec<Vec<Message>>>>,
        last_read: Arc<Mutex<Vec<(Message, UserConversation)>>>,
    }

    #[async_trait]
    impl ReadReceiptSink for RecordingSink {
        async fn mark_read(&self, messages: Vec<Message>) -> Result<()> {
            self.marked.lock().await.push(messages);
            Ok(())
        }

        async fn mark_last_read(
            &self,
            message: Message,
            user_conversation: UserConversation,
        ) -> Result<()> {
            self.last_read.lock().await.push((message, user_conversation));
            Ok(())
        }
    }

    fn confirmed(id: &str, body: &str) -> Message {
        Message {
            id: Some(MessageId::new(id)),
            local_key: LocalKey::generate(),
            creator_id: UserId::new("alice"),
            body: body.to_owned(),
            created_at: Utc::now(),
            delivery_status: DeliveryStatus::Delivered,
        }
    }

    fn pending(body: &str) -> Message {
        Message::pending(
            LocalKey::generate(),
            UserId::new("me"),
            body,
            Utc::now() + Duration::seconds(1),
        )
    }

    fn reconciler(sink: Arc<RecordingSink>) -> MessageReconciler {
        MessageReconciler::new(
            UserConversation {
                conversation: None,
                last_read_message_id: None,
            },
            sink,
        )
    }

    fn ids(messages: &[Message]) -> Vec<&str> {
        messages
            .iter()
            .map(|m| m.id.as_ref().map(|id| id.0.as_str()).unwrap_or("<pending>"))
            .collect()
    }

    async fn drain_spawned() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn prepends_reversed_pages_and_appends_creates() {
        let mut reconciler = reconciler(Arc::new(RecordingSink::default()));

        // newest-first page, as returned by the history source
        reconciler.apply_historical_page(
            vec![confirmed("m3", "3"), confirmed("m2", "2"), confirmed("m1", "1")],
            true,
        );
        reconciler.apply_realtime_event(MessageEvent::Created {
            message: confirmed("m4", "4"),
        });

        assert_eq!(ids(reconciler.messages()), vec!["m1", "m2", "m3", "m4"]);

        // an older page lands in front
        reconciler.apply_historical_page(vec![confirmed("m0", "0")], false);
        assert_eq!(
            ids(reconciler.messages()),
            vec!["m0", "m1", "m2", "m3", "m4"]
        );
    }

    #[tokio::test]
    async fn first_page_marks_read_exactly_once() {
        let sink = Arc::new(RecordingSink::default());
        let mut reconciler = reconciler(sink.clone());

        reconciler.apply_historical_page(
            vec![confirmed("m3", "3"), confirmed("m2", "2"), confirmed("m1", "1")],
            true,
        );
        reconciler.apply_historical_page(vec![confirmed("m0", "0")], false);
        drain_spawned().await;

        let marked = sink.marked.lock().await;
        assert_eq!(marked.len(), 1);
        assert_eq!(marked[0].len(), 3);

        let last_read = sink.last_read.lock().await;
        assert_eq!(last_read.len(), 1);
        // the page head is its newest entry
        assert_eq!(last_read[0].0.id, Some(MessageId::new("m3")));
        assert_eq!(
            last_read[0].1.last_read_message_id,
            Some(MessageId::new("m3"))
        );
    }

    #[tokio::test]
    async fn empty_first_page_marks_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let mut reconciler = reconciler(sink.clone());

        reconciler.apply_historical_page(Vec::new(), true);
        drain_spawned().await;

        assert!(reconciler.is_empty());
        assert!(sink.marked.lock().await.is_empty());
    }

    #[tokio::test]
    async fn redelivered_create_replaces_in_place() {
        let sink = Arc::new(RecordingSink::default());
        let mut reconciler = reconciler(sink.clone());

        let first = confirmed("m1", "hello");
        let mut again = first.clone();
        again.body = "hello (edited)".to_owned();

        reconciler.apply_realtime_event(MessageEvent::Created { message: first });
        reconciler.apply_realtime_event(MessageEvent::Created { message: again });

        assert_eq!(reconciler.messages().len(), 1);
        assert_eq!(reconciler.messages()[0].body, "hello (edited)");
        assert_eq!(
            reconciler.user_conversation().last_read_message_id,
            Some(MessageId::new("m1"))
        );
    }

    #[tokio::test]
    async fn create_marks_the_single_message_read() {
        let sink = Arc::new(RecordingSink::default());
        let mut reconciler = reconciler(sink.clone());

        reconciler.apply_realtime_event(MessageEvent::Created {
            message: confirmed("m1", "hi"),
        });
        drain_spawned().await;

        let marked = sink.marked.lock().await;
        assert_eq!(marked.len(), 1);
        assert_eq!(ids(&marked[0]), vec!["m1"]);
    }

    #[tokio::test]
    async fn unmatched_update_and_delete_are_no_ops() {
        let mut reconciler = reconciler(Arc::new(RecordingSink::default()));
        reconciler.apply_historical_page(vec![confirmed("m1", "1")], false);

        reconciler.apply_realtime_event(MessageEvent::Updated {
            message: confirmed("m9", "ghost"),
        });
        reconciler.apply_realtime_event(MessageEvent::Deleted {
            message: confirmed("m8", "ghost"),
        });

        assert_eq!(ids(reconciler.messages()), vec!["m1"]);
    }

    #[tokio::test]
    async fn update_never_regresses_delivery_status() {
        let mut reconciler = reconciler(Arc::new(RecordingSink::default()));

        let mut read = confirmed("m1", "1");
        read.delivery_status = DeliveryStatus::AllRead;
        reconciler.apply_historical_page(vec![read], false);

        let mut stale = confirmed("m1", "1 (edited)");
        stale.delivery_status = DeliveryStatus::Delivered;
        reconciler.apply_realtime_event(MessageEvent::Updated { message: stale });

        assert_eq!(reconciler.messages()[0].body, "1 (edited)");
        assert_eq!(
            reconciler.messages()[0].delivery_status,
            DeliveryStatus::AllRead
        );
    }

    #[tokio::test]
    async fn resolves_pending_sends_by_local_key() {
        let mut reconciler = reconciler(Arc::new(RecordingSink::default()));
        reconciler.apply_historical_page(vec![confirmed("m1", "1")], false);

        let pending = pending("on its way");
        reconciler.submit_pending_send(pending.clone());
        assert_eq!(ids(reconciler.messages()), vec!["m1", "<pending>"]);

        let mut confirmation = pending.clone();
        confirmation.id = Some(MessageId::new("m2"));
        confirmation.delivery_status = DeliveryStatus::Delivered;

        reconciler
            .resolve_pending_send(&pending.local_key, confirmation)
            .expect("pending entry must resolve");

        assert_eq!(ids(reconciler.messages()), vec!["m1", "m2"]);
        assert_eq!(
            reconciler.messages()[1].delivery_status,
            DeliveryStatus::Delivered
        );
    }

    #[tokio::test]
    async fn mismatched_local_key_leaves_the_sequence_alone() {
        let mut reconciler = reconciler(Arc::new(RecordingSink::default()));
        reconciler.submit_pending_send(pending("on its way"));

        let err = reconciler
            .resolve_pending_send(&LocalKey::generate(), confirmed("m2", "other"))
            .expect_err("unknown local key must not resolve");

        assert!(matches!(err, ReconcileError::PendingNotFound { .. }));
        assert_eq!(reconciler.messages().len(), 1);
        assert!(reconciler.messages()[0].is_pending());
    }

    #[tokio::test]
    async fn delete_reaches_pending_entries_through_the_local_key() {
        let mut reconciler = reconciler(Arc::new(RecordingSink::default()));

        let pending = pending("doomed");
        reconciler.submit_pending_send(pending.clone());

        // server-side delete of the record created from this send
        let mut deleted = pending.clone();
        deleted.id = Some(MessageId::new("m2"));
        reconciler.apply_realtime_event(MessageEvent::Deleted { message: deleted });
        assert!(reconciler.is_empty());

        let mut confirmation = pending.clone();
        confirmation.id = Some(MessageId::new("m2"));
        let err = reconciler
            .resolve_pending_send(&pending.local_key, confirmation.clone())
            .expect_err("the pending entry is gone");
        assert!(matches!(err, ReconcileError::PendingNotFound { .. }));

        reconciler.append_confirmed(confirmation);
        assert_eq!(ids(reconciler.messages()), vec!["m2"]);
    }
}
