//! Admin notification feed derived from waiting chats and new contact
//! messages. Read flags never come from the source records; they live in
//! the read-state side table keyed by synthetic ids.

use std::sync::Arc;

use tracing::info;

use crate::config::NotificationLimits;
use crate::error::AppError;
use crate::store::Store;
use crate::types::{
    ChatSession, ChatStatus, ContactMessage, ContactStatus, Notification, NotificationFeed,
    NotificationId, NotificationKind, NotificationReadState, Sender,
};

const PREVIEW_CHARS: usize = 80;

/// Merges both sources, resolves read flags, sorts newest first and
/// truncates to `max`. Pure so the server and the admin console share it.
pub fn aggregate(
    chats: &[ChatSession],
    contacts: &[ContactMessage],
    read_state: &NotificationReadState,
    max: usize,
) -> NotificationFeed {
    let mut notifications = chats
        .iter()
        .map(|chat| chat_notification(chat, read_state))
        .chain(
            contacts
                .iter()
                .map(|contact| contact_notification(contact, read_state)),
        )
        .collect::<Vec<_>>();

    notifications.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    notifications.truncate(max);

    let unread_count = notifications.iter().filter(|n| !n.read).count();
    NotificationFeed {
        notifications,
        unread_count,
    }
}

fn chat_notification(chat: &ChatSession, read_state: &NotificationReadState) -> Notification {
    let id = NotificationId::chat(&chat.id);
    let preview = chat
        .messages
        .iter()
        .rev()
        .find(|m| m.sender == Sender::User)
        .or_else(|| chat.last_message())
        .map(|m| preview(&m.content))
        .unwrap_or_default();
    Notification {
        read: read_state.is_read(&id),
        id,
        kind: NotificationKind::Chat,
        source_id: chat.id.clone(),
        title: format!("New chat message from {}", chat.user_name),
        preview,
        timestamp: chat.updated_at,
        priority: None,
    }
}

fn contact_notification(
    contact: &ContactMessage,
    read_state: &NotificationReadState,
) -> Notification {
    let id = NotificationId::contact(&contact.id);
    Notification {
        read: read_state.is_read(&id),
        id,
        kind: NotificationKind::Contact,
        source_id: contact.id.clone(),
        title: format!("{} ({})", contact.subject, contact.name),
        preview: preview(&contact.message),
        timestamp: contact.created_at,
        priority: Some(contact.priority),
    }
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head = chars.by_ref().take(PREVIEW_CHARS).collect::<String>();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// Server-side wrapper that fetches the bounded sources and the side table.
#[derive(Clone)]
pub struct Notifier {
    store: Arc<dyn Store>,
    limits: NotificationLimits,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, limits: NotificationLimits) -> Self {
        Self { store, limits }
    }

    pub async fn feed(&self) -> Result<NotificationFeed, AppError> {
        let chats = self
            .store
            .list_sessions(Some(ChatStatus::Waiting), Some(self.limits.per_source))
            .await?;
        let contacts = self
            .store
            .list_contacts(Some(ContactStatus::New), Some(self.limits.per_source))
            .await?;
        let read_state = self.store.read_state().await?;
        Ok(aggregate(&chats, &contacts, &read_state, self.limits.feed))
    }

    pub async fn read_state(&self) -> Result<NotificationReadState, AppError> {
        self.store.read_state().await
    }

    pub async fn mark_as_read(&self, raw_id: &str) -> Result<NotificationId, AppError> {
        let id = raw_id.parse::<NotificationId>()?;
        self.store.mark_read(&id).await?;
        info!(notification_id = %id, "notification marked read");
        Ok(id)
    }

    /// Flags every id of the current feed plus any ids the caller already
    /// knows about, then raises `_markAllRead`. The override is never
    /// cleared, so notifications derived later are reported read as well.
    pub async fn mark_all_as_read(&self, known_ids: &[String]) -> Result<usize, AppError> {
        let mut ids = known_ids
            .iter()
            .map(|raw| raw.parse::<NotificationId>())
            .collect::<Result<Vec<_>, _>>()?;
        ids.extend(self.feed().await?.notifications.into_iter().map(|n| n.id));
        ids.sort();
        ids.dedup();

        self.store.mark_all_read(&ids).await?;
        info!(count = ids.len(), "all notifications marked read");
        Ok(ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::Engine;
    use crate::store::MemoryStore;
    use crate::types::{ContactPriority, NewContact, ReadFlag};
    use chrono::{Duration, Utc};

    fn chat(id: &str, minutes_ago: i64) -> ChatSession {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        ChatSession {
            id: id.into(),
            user_email: format!("{id}@example.com"),
            user_name: format!("Visitor {id}"),
            status: ChatStatus::Waiting,
            created_at: at,
            updated_at: at,
            messages: vec![],
        }
    }

    fn contact(id: &str, minutes_ago: i64) -> ContactMessage {
        let at = Utc::now() - Duration::minutes(minutes_ago);
        ContactMessage {
            id: id.into(),
            name: "Lina".into(),
            email: "lina@example.com".into(),
            subject: "Refund".into(),
            message: "Please refund my order".into(),
            priority: ContactPriority::Medium,
            status: ContactStatus::New,
            created_at: at,
            updated_at: at,
            replies: vec![],
        }
    }

    #[test]
    fn feed_is_sorted_newest_first_and_truncated() {
        let chats = (0..8).map(|i| chat(&format!("c{i}"), i * 2)).collect::<Vec<_>>();
        let contacts = (0..8)
            .map(|i| contact(&format!("k{i}"), i * 2 + 1))
            .collect::<Vec<_>>();

        let feed = aggregate(&chats, &contacts, &NotificationReadState::default(), 10);
        assert_eq!(feed.notifications.len(), 10);
        assert_eq!(feed.notifications[0].id.to_string(), "chat-c0");
        assert_eq!(feed.notifications[1].id.to_string(), "contact-k0");
        assert!(feed
            .notifications
            .windows(2)
            .all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(feed.unread_count, 10);
    }

    #[test]
    fn read_flags_resolve_from_side_table_only() {
        let mut state = NotificationReadState::default();
        state
            .notifications
            .insert(NotificationId::chat("123"), ReadFlag { read: true });

        let feed = aggregate(
            &[chat("123", 1), chat("124", 2)],
            &[contact("9", 3)],
            &state,
            10,
        );
        let read = |id: &str| {
            feed.notifications
                .iter()
                .find(|n| n.id.to_string() == id)
                .map(|n| n.read)
        };
        assert_eq!(read("chat-123"), Some(true));
        assert_eq!(read("chat-124"), Some(false));
        assert_eq!(read("contact-9"), Some(false));
        assert_eq!(feed.unread_count, 2);
    }

    #[test]
    fn global_override_forces_every_entry_read() {
        let state = NotificationReadState {
            mark_all_read: true,
            ..Default::default()
        };
        let feed = aggregate(&[chat("1", 1)], &[contact("2", 2)], &state, 10);
        assert!(feed.notifications.iter().all(|n| n.read));
        assert_eq!(feed.unread_count, 0);
    }

    #[test]
    fn long_messages_are_previewed() {
        let mut long = contact("1", 1);
        long.message = "x".repeat(200);
        let feed = aggregate(&[], &[long], &NotificationReadState::default(), 10);
        assert_eq!(feed.notifications[0].preview.chars().count(), PREVIEW_CHARS + 3);
    }

    #[tokio::test]
    async fn marking_one_chat_read_leaves_status_and_siblings_alone() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone());
        let notifier = Notifier::new(store.clone(), NotificationLimits::default());

        let first = engine.create_session(None, None).await.unwrap();
        let second = engine.create_session(None, None).await.unwrap();
        for chat in [&first, &second] {
            engine
                .append_message(&chat.chat_id, "hello", Sender::User)
                .await
                .unwrap();
        }

        notifier
            .mark_as_read(&format!("chat-{}", first.chat_id))
            .await
            .unwrap();

        let session = store.get_session(&first.chat_id).await.unwrap().unwrap();
        assert_eq!(session.status, ChatStatus::Waiting);

        let feed = notifier.feed().await.unwrap();
        let flag = |chat_id: &str| {
            feed.notifications
                .iter()
                .find(|n| n.source_id == chat_id)
                .map(|n| n.read)
        };
        assert_eq!(flag(&first.chat_id), Some(true));
        assert_eq!(flag(&second.chat_id), Some(false));
        assert_eq!(feed.unread_count, 1);

        let state = notifier.read_state().await.unwrap();
        assert!(!state.mark_all_read);
    }

    #[tokio::test]
    async fn mark_all_read_covers_chats_that_arrive_later() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone());
        let notifier = Notifier::new(store.clone(), NotificationLimits::default());

        let before = engine.create_session(None, None).await.unwrap();
        engine
            .append_message(&before.chat_id, "anyone there?", Sender::User)
            .await
            .unwrap();

        let marked = notifier
            .mark_all_as_read(&["contact-known".to_string()])
            .await
            .unwrap();
        assert_eq!(marked, 2);

        let later = engine.create_session(None, None).await.unwrap();
        engine
            .append_message(&later.chat_id, "hi", Sender::User)
            .await
            .unwrap();
        store
            .create_contact(NewContact {
                name: "Ali".into(),
                email: "ali@example.com".into(),
                subject: "Question".into(),
                message: "Do you ship abroad?".into(),
                priority: ContactPriority::Low,
            })
            .await
            .unwrap();

        let feed = notifier.feed().await.unwrap();
        assert_eq!(feed.notifications.len(), 3);
        assert!(feed.notifications.iter().all(|n| n.read));
        assert_eq!(feed.unread_count, 0);

        let state = notifier.read_state().await.unwrap();
        assert!(state.mark_all_read);
        assert!(state
            .notifications
            .contains_key(&NotificationId::chat(before.chat_id.as_str())));
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let notifier = Notifier::new(store, NotificationLimits::default());
        let err = notifier.mark_as_read("order-7").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidNotificationId(_)));
    }
}
