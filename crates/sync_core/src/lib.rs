//! Sync coordinator: the merge engine between live socket events, REST
//! catch-up and the local store.
//!
//! Callers drive it with intents (send message, load history, mark read) and
//! observe the store reactively; inbound socket traffic is reconciled by a
//! single background pump so readers never see torn state.

pub mod api;
pub mod profiles;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine;
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use shared::{
    domain::{conversation_key, iso_now, MessageKind, MessageStatus},
    error::{FatalTransportError, SendError},
    protocol::{
        ChatEvent, ConversationDto, ConversationUpdateDto, MediaUploadRequest, MessageDto,
        ParticipantDto, TypingDto,
    },
};
use storage::{
    now_millis, ConversationWithParticipants, Store, StoreChange, StoredConversation,
    StoredMessage, StoredParticipant,
};
use transport::{ChatSocket, ConnState, SocketEvent};

pub use crate::api::{ChatApi, ProfileService};
pub use crate::profiles::ProfileCache;

pub const EPOCH_START: &str = "1970-01-01T00:00:00.000Z";
pub const DEFAULT_HISTORY_PAGE_SIZE: u32 = 50;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Out-of-band notifications for callers. Store mutations are not mirrored
/// here; observe those through [`ChatSync::subscribe_store_changes`].
#[derive(Debug, Clone)]
pub enum SyncEvent {
    Connection(ConnState),
    Typing(TypingDto),
    Fatal(FatalTransportError),
}

struct SyncState {
    user_id: Option<String>,
    event_task: Option<JoinHandle<()>>,
}

pub struct ChatSync {
    store: Store,
    api: ChatApi,
    socket: Arc<ChatSocket>,
    profiles: Arc<ProfileCache>,
    inner: Mutex<SyncState>,
    events: broadcast::Sender<SyncEvent>,
}

impl ChatSync {
    pub fn new(
        store: Store,
        api: ChatApi,
        socket: Arc<ChatSocket>,
        profiles: Arc<ProfileCache>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            store,
            api,
            socket,
            profiles,
            inner: Mutex::new(SyncState {
                user_id: None,
                event_task: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_store_changes(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn profiles(&self) -> &Arc<ProfileCache> {
        &self.profiles
    }

    /// Adopts `user_id` as the active identity. A switch from a different
    /// user wipes all local chat data first so nothing leaks across
    /// accounts. Connects the socket and runs a best-effort initial
    /// catch-up; catch-up failures are recoverable and only logged.
    pub async fn initialize_for_user(self: &Arc<Self>, user_id: &str, token: &str) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            let switching = guard
                .user_id
                .as_deref()
                .is_some_and(|previous| previous != user_id);
            if switching {
                info!(user_id, "user switched, wiping local chat data");
                self.store.clear_all_chat_data().await?;
            }
            guard.user_id = Some(user_id.to_string());
            if guard.event_task.is_none() {
                let task =
                    tokio::spawn(Arc::clone(self).pump_events(self.socket.subscribe_events()));
                guard.event_task = Some(task);
            }
        }

        self.socket.connect(user_id, token).await;

        if let Err(err) = self.fetch_conversations(user_id).await {
            warn!(error = %err, "initial conversation fetch failed");
        }
        if let Err(err) = self.sync_data().await {
            warn!(error = %err, "initial delta sync failed");
        }
        Ok(())
    }

    /// Stops the event pump and releases the socket. In-flight REST calls
    /// are left to finish naturally; their upserts are idempotent.
    pub async fn close(&self) {
        let task = { self.inner.lock().await.event_task.take() };
        if let Some(task) = task {
            task.abort();
        }
        self.socket.disconnect().await;
    }

    pub async fn clear_all_data(&self) -> Result<()> {
        self.store.clear_all_chat_data().await
    }

    // Reactive read surface; callers pair these with
    // `subscribe_store_changes` to re-query on change.

    pub async fn conversations(&self) -> Result<Vec<ConversationWithParticipants>> {
        self.store.conversations().await
    }

    pub async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationWithParticipants>> {
        self.store.conversations_for_user(user_id).await
    }

    pub async fn messages_for_chat(&self, chat_id: &str) -> Result<Vec<StoredMessage>> {
        self.store.messages_for_chat(chat_id).await
    }

    pub async fn participant(&self, user_id: &str) -> Result<Option<StoredParticipant>> {
        self.store.participant(user_id).await
    }

    /// Pulls the remote conversation list and merges it in. Wire participant
    /// data never blanks locally known names or avatars; placeholders get a
    /// background profile refresh.
    pub async fn fetch_conversations(&self, user_id: &str) -> Result<()> {
        let conversations = self.api.conversations(user_id).await?;
        info!(count = conversations.len(), "fetched conversation list");
        for dto in conversations {
            if let Err(err) = self.apply_conversation_dto(user_id, &dto).await {
                warn!(chat_id = %dto.chat_id, error = %err, "failed to apply conversation");
            }
        }
        Ok(())
    }

    /// Delta sync from the newest locally known conversation timestamp
    /// (epoch start on a cold store).
    pub async fn sync_data(&self) -> Result<()> {
        let since = self
            .store
            .conversations()
            .await?
            .into_iter()
            .next()
            .and_then(|c| c.conversation.last_message_timestamp)
            .unwrap_or_else(|| EPOCH_START.to_string());

        let response = self.api.sync_since(&since).await?;
        debug!(
            messages = response.messages.len(),
            status_updates = response.status_updates.len(),
            "applying delta sync"
        );

        let me = self.current_user().await;
        for message in &response.messages {
            let stored = self.stored_message(message, me.as_deref());
            self.store.upsert_message(&stored).await?;
        }
        for update in &response.status_updates {
            self.store
                .update_message_status(&update.message_id, update.status)
                .await?;
        }
        Ok(())
    }

    pub async fn load_history(&self, chat_id: &str) -> Result<usize> {
        self.load_history_page(chat_id, 0, DEFAULT_HISTORY_PAGE_SIZE)
            .await
    }

    /// Returns how many messages the page contained; a short page means the
    /// end of history.
    pub async fn load_history_page(&self, chat_id: &str, page: u32, size: u32) -> Result<usize> {
        let messages = self.api.history(chat_id, page, size).await?;
        let me = self.current_user().await;
        for message in &messages {
            let stored = self.stored_message(message, me.as_deref());
            self.store.upsert_message(&stored).await?;
        }
        Ok(messages.len())
    }

    /// Sends a chat message with optimistic local persistence. Returns the
    /// persisted message id, or `None` when the content is empty. While the
    /// socket is down the message lands locally as `pending`; without even
    /// an active transport identity a `local-` fallback id is synthesized so
    /// the UI still gets immediate feedback.
    pub async fn send_message(
        &self,
        recipient_id: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<Option<String>> {
        if content.trim().is_empty() {
            return Ok(None);
        }

        match self.socket.prepare_outbound(recipient_id, content, kind).await {
            Ok(message) => {
                let sent_now = self.socket.send_prepared(&message).await;
                let me = self.current_user().await;
                let mut stored = self.stored_message(&message, me.as_deref());
                if !sent_now {
                    stored.status = MessageStatus::Pending;
                }
                self.store.upsert_message(&stored).await?;
                self.update_local_conversation(&stored, me.as_deref())
                    .await?;
                Ok(Some(stored.message_id))
            }
            Err(SendError::EmptyContent) => Ok(None),
            Err(SendError::NotReady) => {
                let Some(sender) = self.current_user().await else {
                    return Ok(None);
                };
                let stored = StoredMessage {
                    message_id: local_message_id(),
                    chat_id: conversation_key(&sender, recipient_id),
                    sender_id: sender.clone(),
                    recipient_id: recipient_id.to_string(),
                    content: content.trim().to_string(),
                    timestamp: iso_now(),
                    status: MessageStatus::Pending,
                    kind,
                    metadata: Some(HashMap::from([("local".to_string(), "true".to_string())])),
                };
                self.store.upsert_message(&stored).await?;
                self.update_local_conversation(&stored, Some(&sender))
                    .await?;
                Ok(Some(stored.message_id))
            }
        }
    }

    pub async fn send_typing(&self, recipient_id: &str, is_typing: bool) {
        self.socket.send_typing(recipient_id, is_typing).await;
    }

    /// Bulk-transitions the other party's unread messages to read and zeroes
    /// the unread counter, as one atomic unit in the store.
    pub async fn mark_messages_read(&self, chat_id: &str, user_id: &str) -> Result<()> {
        self.store.mark_messages_read(chat_id, user_id).await
    }

    /// Sends a read receipt for every unread inbound message in the chat,
    /// then marks the whole chat read locally.
    pub async fn acknowledge_messages(&self, chat_id: &str, user_id: &str) -> Result<()> {
        let unread = self.store.unread_messages(chat_id, user_id).await?;
        if unread.is_empty() {
            return Ok(());
        }
        for message in &unread {
            self.socket
                .send_read_ack(&message.message_id, &message.sender_id)
                .await;
        }
        self.mark_messages_read(chat_id, user_id).await
    }

    pub async fn upload_media(&self, data: &[u8], filename: &str) -> Result<String> {
        let request = MediaUploadRequest {
            data: base64::engine::general_purpose::STANDARD.encode(data),
            filename: filename.to_string(),
        };
        let response = self.api.upload_media(&request).await?;
        Ok(response.url)
    }

    /// Sweeps the user's conversations and synchronously fetches profiles
    /// for any participant still known only as a placeholder.
    pub async fn ensure_participant_profiles(&self, user_id: &str) -> Result<()> {
        let conversations = self.store.conversations_for_user(user_id).await?;
        for conversation in &conversations {
            for participant in &conversation.participants {
                if participant.user_id == user_id || !participant.is_placeholder() {
                    continue;
                }
                if let Err(err) = self.profiles.fetch_and_cache(&participant.user_id).await {
                    debug!(
                        user_id = %participant.user_id,
                        error = %err,
                        "profile sweep fetch failed"
                    );
                }
            }
        }
        Ok(())
    }

    /// Reconciles one inbound socket event into the store. Errors here are
    /// per-event; the pump logs them and keeps going.
    pub async fn handle_event(&self, event: ChatEvent) -> Result<()> {
        match event {
            ChatEvent::Message(message) => self.reconcile_message(message).await,
            ChatEvent::ConversationUpdate(update) => {
                self.reconcile_conversation_update(update).await
            }
            ChatEvent::StatusUpdate(update) => {
                self.store
                    .update_message_status(&update.message_id, update.status)
                    .await?;
                Ok(())
            }
            ChatEvent::ReadReceipt(receipt) => {
                self.store
                    .update_message_status(&receipt.message_id, MessageStatus::Read)
                    .await?;
                Ok(())
            }
            ChatEvent::Presence(presence) => {
                let online = presence.is_online();
                let last_seen = if online {
                    self.store
                        .participant(&presence.user_id)
                        .await?
                        .and_then(|p| p.last_seen)
                } else {
                    Some(now_millis())
                };
                self.store
                    .update_presence(&presence.user_id, online, last_seen)
                    .await
            }
            ChatEvent::Typing(typing) => {
                let _ = self.events.send(SyncEvent::Typing(typing));
                Ok(())
            }
            ChatEvent::Unknown { topic } => {
                debug!(topic, "ignoring event for unrecognized topic");
                Ok(())
            }
        }
    }

    async fn pump_events(self: Arc<Self>, mut rx: broadcast::Receiver<SocketEvent>) {
        loop {
            match rx.recv().await {
                Ok(SocketEvent::Event(event)) => {
                    if let Err(err) = self.handle_event(event).await {
                        warn!(error = %err, "event reconciliation failed");
                    }
                }
                Ok(SocketEvent::StateChanged(state)) => {
                    if state == ConnState::Connected {
                        if let Err(err) = self.sync_data().await {
                            warn!(error = %err, "catch-up sync failed");
                        }
                    }
                    let _ = self.events.send(SyncEvent::Connection(state));
                }
                Ok(SocketEvent::Fatal(err)) => {
                    let _ = self.events.send(SyncEvent::Fatal(err));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "socket event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    // A known message still goes through the upsert (its status may advance)
    // but must not bump counters or rewrite the snippet, so duplicate
    // delivery cannot drift the unread count.
    async fn reconcile_message(&self, message: MessageDto) -> Result<()> {
        let me = self.current_user().await;
        let stored = self.stored_message(&message, me.as_deref());
        let duplicate = self.store.message(&stored.message_id).await?.is_some();
        self.store.upsert_message(&stored).await?;
        if duplicate {
            debug!(message_id = %stored.message_id, "duplicate message event");
            return Ok(());
        }
        self.update_local_conversation(&stored, me.as_deref()).await
    }

    async fn reconcile_conversation_update(&self, update: ConversationUpdateDto) -> Result<()> {
        let me = self.current_user().await;
        let existing = self.store.conversation(&update.chat_id).await?;
        let dto_participants = update.participants.unwrap_or_default();

        let mut participants = Vec::with_capacity(dto_participants.len());
        for dto in &dto_participants {
            participants.push(self.merge_participant(dto).await?);
        }

        let participant_ids: Vec<String> = if dto_participants.is_empty() {
            existing
                .as_ref()
                .map(|c| c.participants.clone())
                .unwrap_or_default()
        } else {
            dto_participants.iter().map(|p| p.user_id.clone()).collect()
        };

        let conversation = StoredConversation {
            chat_id: update.chat_id.clone(),
            last_message: update
                .last_message
                .clone()
                .or_else(|| existing.as_ref().and_then(|c| c.last_message.clone())),
            last_message_timestamp: update.last_message_timestamp.clone().or_else(|| {
                existing
                    .as_ref()
                    .and_then(|c| c.last_message_timestamp.clone())
            }),
            unread_counts: if update.unread_counts.is_empty() {
                existing
                    .as_ref()
                    .map(|c| c.unread_counts.clone())
                    .unwrap_or_default()
            } else {
                update.unread_counts.clone()
            },
            participants: participant_ids,
            updated_at: update.updated_at.clone(),
        };
        self.store
            .upsert_conversation_with_participants(&conversation, &participants)
            .await?;

        for participant in &participants {
            if Some(participant.user_id.as_str()) != me.as_deref() && participant.is_placeholder()
            {
                self.profiles.spawn_refresh(&participant.user_id);
            }
        }
        Ok(())
    }

    async fn apply_conversation_dto(&self, user_id: &str, dto: &ConversationDto) -> Result<()> {
        let mut participants = Vec::with_capacity(dto.participants.len());
        for participant in &dto.participants {
            participants.push(self.merge_participant(participant).await?);
        }

        let conversation = StoredConversation {
            chat_id: dto.chat_id.clone(),
            last_message: dto.last_message.as_ref().and_then(|m| m.snippet.clone()),
            last_message_timestamp: dto
                .last_message
                .as_ref()
                .and_then(|m| m.timestamp.clone())
                .or_else(|| Some(dto.updated_at.clone())),
            unread_counts: dto.unread_counts.clone(),
            participants: dto.participants.iter().map(|p| p.user_id.clone()).collect(),
            updated_at: dto.updated_at.clone(),
        };
        self.store
            .upsert_conversation_with_participants(&conversation, &participants)
            .await?;

        for participant in &participants {
            if participant.user_id != user_id && participant.is_placeholder() {
                self.profiles.spawn_refresh(&participant.user_id);
            }
        }
        Ok(())
    }

    // Placeholder names and missing avatars never overwrite cached data.
    async fn merge_participant(&self, dto: &ParticipantDto) -> Result<StoredParticipant> {
        let existing = self.store.participant(&dto.user_id).await?;
        let name = if dto.name.trim().is_empty() || dto.name == "User" {
            existing
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "User".to_string())
        } else {
            dto.name.clone()
        };
        Ok(StoredParticipant {
            user_id: dto.user_id.clone(),
            name,
            avatar_url: dto
                .profile_picture_url
                .clone()
                .or_else(|| existing.as_ref().and_then(|p| p.avatar_url.clone())),
            is_online: existing.as_ref().is_some_and(|p| p.is_online),
            last_seen: existing.as_ref().and_then(|p| p.last_seen),
            last_updated: now_millis(),
        })
    }

    // Synthesizes the conversation for a first message, bumps the unread
    // counter when we are the recipient, refreshes the snippet.
    async fn update_local_conversation(
        &self,
        message: &StoredMessage,
        me: Option<&str>,
    ) -> Result<()> {
        if self.store.conversation(&message.chat_id).await?.is_none() {
            if message.recipient_id.is_empty() {
                // Without a resolvable recipient the derived key is garbage;
                // keep the message, skip the conversation row.
                debug!(
                    message_id = %message.message_id,
                    "recipient unresolved, skipping conversation synthesis"
                );
                return Ok(());
            }
            self.synthesize_conversation(message).await?;
        }
        let Some(conversation) = self.store.conversation(&message.chat_id).await? else {
            return Ok(());
        };

        let mut counts = conversation.unread_counts;
        if let Some(me) = me {
            if message.recipient_id == me {
                *counts.entry(me.to_string()).or_insert(0) += 1;
            }
        }
        self.store
            .update_conversation_snippet(
                &message.chat_id,
                &message.content,
                &message.timestamp,
                &counts,
            )
            .await
    }

    // The participant pair falls out of the conversation key; unknown
    // profiles are fetched synchronously so the list renders with names.
    async fn synthesize_conversation(&self, message: &StoredMessage) -> Result<()> {
        let participant_ids: Vec<String> = message
            .chat_id
            .split('_')
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect();

        let mut participants = Vec::with_capacity(participant_ids.len());
        for user_id in &participant_ids {
            let existing = self.store.participant(user_id).await?;
            let needs_fetch = existing
                .as_ref()
                .map_or(true, StoredParticipant::is_placeholder);
            let resolved = if needs_fetch {
                if let Err(err) = self.profiles.fetch_and_cache(user_id).await {
                    debug!(user_id, error = %err, "profile fetch for new conversation failed");
                }
                self.store.participant(user_id).await?.or(existing)
            } else {
                existing
            };
            participants
                .push(resolved.unwrap_or_else(|| StoredParticipant::placeholder(user_id.clone())));
        }

        let conversation = StoredConversation {
            chat_id: message.chat_id.clone(),
            last_message: Some(message.content.clone()),
            last_message_timestamp: Some(message.timestamp.clone()),
            unread_counts: HashMap::new(),
            participants: participant_ids,
            updated_at: message.timestamp.clone(),
        };
        self.store
            .upsert_conversation_with_participants(&conversation, &participants)
            .await
    }

    // Missing recipient and chat id fields are reconstructed from the sender
    // and the authenticated user.
    fn stored_message(&self, dto: &MessageDto, me: Option<&str>) -> StoredMessage {
        let recipient_id = dto.recipient_id.clone().unwrap_or_else(|| match me {
            Some(me) if dto.sender_id != me => me.to_string(),
            _ => String::new(),
        });
        let chat_id = dto
            .chat_id
            .clone()
            .unwrap_or_else(|| conversation_key(&dto.sender_id, &recipient_id));
        StoredMessage {
            message_id: dto.message_id.clone(),
            chat_id,
            sender_id: dto.sender_id.clone(),
            recipient_id,
            content: dto.content.clone(),
            timestamp: dto.timestamp.clone(),
            status: dto.status,
            kind: dto.kind,
            metadata: dto.metadata.clone(),
        }
    }

    async fn current_user(&self) -> Option<String> {
        self.inner.lock().await.user_id.clone()
    }
}

fn local_message_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("local-{}", &uuid[..8])
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
