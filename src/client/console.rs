//! Admin support console: a periodically refreshed snapshot of chats,
//! contact messages, ratings and the notification feed, plus the actions
//! support staff take on them.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::api::{AdminApi, ClientError};
use super::poller::Poller;
use super::ADMIN_POLL_INTERVAL;
use crate::config::NotificationLimits;
use crate::notifications;
use crate::types::{
    ChatSession, ChatStatus, ContactMessage, ContactStatus, Message, NotificationFeed,
    NotificationId, Rating, RatingStats,
};

#[derive(Debug, Clone, Default)]
pub struct ConsoleSnapshot {
    pub chats: Vec<ChatSession>,
    pub contacts: Vec<ContactMessage>,
    pub ratings: Vec<Rating>,
    pub rating_stats: Option<RatingStats>,
    pub feed: NotificationFeed,
    pub last_error: Option<String>,
}

impl ConsoleSnapshot {
    pub fn chats_with(&self, status: ChatStatus) -> impl Iterator<Item = &ChatSession> {
        self.chats.iter().filter(move |c| c.status == status)
    }
}

pub struct AdminConsole {
    api: Arc<dyn AdminApi>,
    limits: NotificationLimits,
    snapshot: Arc<Mutex<ConsoleSnapshot>>,
    poller: Mutex<Option<Poller>>,
}

impl AdminConsole {
    pub fn new(api: Arc<dyn AdminApi>, limits: NotificationLimits) -> Self {
        Self {
            api,
            limits,
            snapshot: Arc::new(Mutex::new(ConsoleSnapshot::default())),
            poller: Mutex::new(None),
        }
    }

    pub async fn snapshot(&self) -> ConsoleSnapshot {
        self.snapshot.lock().await.clone()
    }

    pub async fn refresh(&self) -> Result<(), ClientError> {
        refresh_snapshot(self.api.as_ref(), self.limits, &self.snapshot).await
    }

    /// Refreshes now and then every 30 seconds until [`AdminConsole::stop`].
    pub async fn start(&self) {
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "initial console refresh failed");
        }
        let api = self.api.clone();
        let snapshot = self.snapshot.clone();
        let limits = self.limits;
        let poller = Poller::spawn("admin-console", ADMIN_POLL_INTERVAL, move || {
            let api = api.clone();
            let snapshot = snapshot.clone();
            async move {
                if let Err(err) = refresh_snapshot(api.as_ref(), limits, &snapshot).await {
                    warn!(error = %err, "console refresh failed");
                }
            }
        });
        if let Some(previous) = self.poller.lock().await.replace(poller) {
            previous.stop();
        }
    }

    pub async fn stop(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop();
        }
    }

    pub async fn reply_to_chat(&self, chat_id: &str, content: &str) -> Result<Message, ClientError> {
        let message = self.api.reply_to_chat(chat_id, content).await?;
        info!(chat_id, "support replied to chat");
        self.refresh_quietly().await;
        Ok(message)
    }

    pub async fn set_chat_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<ChatSession, ClientError> {
        let chat = self.api.update_chat_status(chat_id, status).await?;
        self.refresh_quietly().await;
        Ok(chat)
    }

    pub async fn reply_to_contact(
        &self,
        contact_id: &str,
        message: &str,
    ) -> Result<ContactMessage, ClientError> {
        let contact = self.api.reply_to_contact(contact_id, message).await?;
        info!(contact_id, "support replied to contact message");
        self.refresh_quietly().await;
        Ok(contact)
    }

    pub async fn set_contact_status(
        &self,
        contact_id: &str,
        status: ContactStatus,
    ) -> Result<ContactMessage, ClientError> {
        let contact = self.api.update_contact_status(contact_id, status).await?;
        self.refresh_quietly().await;
        Ok(contact)
    }

    /// Flags one notification read. The local feed is updated right away.
    pub async fn mark_read(&self, id: &NotificationId) -> Result<(), ClientError> {
        self.api.mark_read(id).await?;
        let mut snapshot = self.snapshot.lock().await;
        let feed = &mut snapshot.feed;
        if let Some(entry) = feed.notifications.iter_mut().find(|n| &n.id == id) {
            entry.read = true;
        }
        feed.unread_count = feed.notifications.iter().filter(|n| !n.read).count();
        Ok(())
    }

    /// Flags everything currently shown and raises the server-side global
    /// override so later notifications come in read too.
    pub async fn mark_all_read(&self) -> Result<usize, ClientError> {
        let ids = {
            let snapshot = self.snapshot.lock().await;
            snapshot
                .feed
                .notifications
                .iter()
                .map(|n| n.id.clone())
                .collect::<Vec<_>>()
        };
        self.api.mark_all_read(&ids).await?;
        let mut snapshot = self.snapshot.lock().await;
        for entry in snapshot.feed.notifications.iter_mut() {
            entry.read = true;
        }
        snapshot.feed.unread_count = 0;
        Ok(ids.len())
    }

    async fn refresh_quietly(&self) {
        if let Err(err) = self.refresh().await {
            warn!(error = %err, "console refresh after action failed");
        }
    }
}

/// Each source is fetched independently; a failing one keeps its previous
/// data and the first error is reported.
async fn refresh_snapshot(
    api: &dyn AdminApi,
    limits: NotificationLimits,
    snapshot: &Mutex<ConsoleSnapshot>,
) -> Result<(), ClientError> {
    let chats = api.list_chats(None).await;
    let contacts = api.list_contacts(None).await;
    let ratings = api.ratings().await;
    let read_state = api.read_state().await;

    let mut snapshot = snapshot.lock().await;
    let mut first_error = None;
    match chats {
        Ok(chats) => snapshot.chats = chats,
        Err(err) => first_error = first_error.or(Some(err)),
    }
    match contacts {
        Ok(contacts) => snapshot.contacts = contacts,
        Err(err) => first_error = first_error.or(Some(err)),
    }
    match ratings {
        Ok((ratings, stats)) => {
            snapshot.ratings = ratings;
            snapshot.rating_stats = Some(stats);
        }
        Err(err) => first_error = first_error.or(Some(err)),
    }
    match read_state {
        Ok(read_state) => {
            let waiting = snapshot
                .chats_with(ChatStatus::Waiting)
                .take(limits.per_source)
                .cloned()
                .collect::<Vec<_>>();
            let new_contacts = snapshot
                .contacts
                .iter()
                .filter(|c| c.status == ContactStatus::New)
                .take(limits.per_source)
                .cloned()
                .collect::<Vec<_>>();
            snapshot.feed =
                notifications::aggregate(&waiting, &new_contacts, &read_state, limits.feed);
        }
        Err(err) => first_error = first_error.or(Some(err)),
    }

    snapshot.last_error = first_error.as_ref().map(ToString::to_string);
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppState;
    use crate::client::api::LocalClient;
    use crate::store::{MemoryStore, Store};
    use crate::types::{ContactPriority, NewContact, Sender};
    use std::time::Duration;

    fn console() -> (AdminConsole, Arc<AppState>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let server = Arc::new(AppState::new(store, NotificationLimits::default()));
        let api = Arc::new(LocalClient::new(server.clone()));
        (AdminConsole::new(api, NotificationLimits::default()), server)
    }

    async fn waiting_chat(server: &AppState, name: &str, text: &str) -> String {
        let created = server
            .engine
            .create_session(Some(&format!("{name}@example.com")), Some(name))
            .await
            .unwrap();
        server
            .engine
            .append_message(&created.chat_id, text, Sender::User)
            .await
            .unwrap();
        created.chat_id
    }

    #[tokio::test]
    async fn support_reply_moves_chat_to_active_and_out_of_the_feed() {
        let (console, server) = console();
        let chat_id = waiting_chat(&server, "huda", "هل يمكنني الدفع بالبطاقة؟").await;

        console.refresh().await.unwrap();
        let snapshot = console.snapshot().await;
        assert_eq!(snapshot.chats_with(ChatStatus::Waiting).count(), 1);
        assert_eq!(snapshot.feed.unread_count, 1);
        assert_eq!(snapshot.feed.notifications[0].source_id, chat_id);

        let reply = console
            .reply_to_chat(&chat_id, "نعم، نقبل جميع البطاقات")
            .await
            .unwrap();
        assert_eq!(reply.sender, Sender::Support);

        let snapshot = console.snapshot().await;
        assert_eq!(snapshot.chats_with(ChatStatus::Active).count(), 1);
        assert!(snapshot.feed.notifications.is_empty());
        let messages = server.engine.list_messages(&chat_id).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn mark_read_and_mark_all_read_update_the_feed() {
        let (console, server) = console();
        let first = waiting_chat(&server, "adel", "مرحبا").await;
        waiting_chat(&server, "rima", "أحتاج مساعدة").await;
        server
            .engine
            .store()
            .create_contact(NewContact {
                name: "Zaid".into(),
                email: "zaid@example.com".into(),
                subject: "Invoice".into(),
                message: "Please resend my invoice".into(),
                priority: ContactPriority::High,
            })
            .await
            .unwrap();

        console.refresh().await.unwrap();
        assert_eq!(console.snapshot().await.feed.unread_count, 3);

        console.mark_read(&NotificationId::chat(first.as_str())).await.unwrap();
        assert_eq!(console.snapshot().await.feed.unread_count, 2);
        console.refresh().await.unwrap();
        assert_eq!(console.snapshot().await.feed.unread_count, 2);

        assert_eq!(console.mark_all_read().await.unwrap(), 3);
        assert_eq!(console.snapshot().await.feed.unread_count, 0);

        waiting_chat(&server, "noor", "سؤال جديد").await;
        console.refresh().await.unwrap();
        let snapshot = console.snapshot().await;
        assert_eq!(snapshot.feed.notifications.len(), 4);
        assert_eq!(snapshot.feed.unread_count, 0);
    }

    #[tokio::test]
    async fn contact_reply_and_status_changes_round_trip() {
        let (console, server) = console();
        let contact = server
            .engine
            .store()
            .create_contact(NewContact {
                name: "Salma".into(),
                email: "salma@example.com".into(),
                subject: "Download link".into(),
                message: "The link expired".into(),
                priority: ContactPriority::Medium,
            })
            .await
            .unwrap();

        let replied = console
            .reply_to_contact(&contact.id, "We sent you a new link")
            .await
            .unwrap();
        assert_eq!(replied.status, ContactStatus::Replied);
        assert_eq!(replied.replies.len(), 1);
        assert!(console.snapshot().await.feed.notifications.is_empty());

        let closed = console
            .set_contact_status(&contact.id, ContactStatus::Closed)
            .await
            .unwrap();
        assert_eq!(closed.status, ContactStatus::Closed);

        let err = console
            .reply_to_contact("missing", "hello")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ratings_are_summarised() {
        let (console, server) = console();
        let chat_id = waiting_chat(&server, "fadi", "hi").await;
        for stars in [5, 4, 4] {
            server
                .engine
                .submit_rating(&chat_id, stars, None, None)
                .await
                .unwrap();
        }
        console
            .set_chat_status(&chat_id, ChatStatus::Closed)
            .await
            .unwrap();

        let snapshot = console.snapshot().await;
        let stats = snapshot.rating_stats.clone().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.average, 4.33);
        assert_eq!(snapshot.ratings.len(), 3);
        assert_eq!(snapshot.chats_with(ChatStatus::Closed).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_refreshes_every_thirty_seconds() {
        let (console, server) = console();
        console.start().await;
        assert!(console.snapshot().await.chats.is_empty());

        waiting_chat(&server, "lama", "hello").await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(console.snapshot().await.chats.is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(console.snapshot().await.chats.len(), 1);

        console.stop().await;
        waiting_chat(&server, "tala", "hello").await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(console.snapshot().await.chats.len(), 1);
    }
}
