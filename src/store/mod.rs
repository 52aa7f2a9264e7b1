//! Persistence seams for chats, ratings, contact messages and the
//! notification read-state side table.

use async_trait::async_trait;

use crate::error::AppError;
use crate::types::{
    ChatSession, ChatStatus, ContactMessage, ContactPriority, ContactReply, ContactStatus, Message,
    NewContact, NotificationId, NotificationReadState, Rating, Sender,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create_session(&self, user_email: &str, user_name: &str)
        -> Result<ChatSession, AppError>;

    async fn get_session(&self, chat_id: &str) -> Result<Option<ChatSession>, AppError>;

    async fn count_sessions_for(&self, user_email: &str) -> Result<usize, AppError>;

    /// Appends one message atomically: the session's current status is
    /// checked with [`ChatStatus::after_message`], the message is stored with
    /// status `sent`, and the session's status and `updated_at` advance in
    /// the same step. Nothing is written when the check fails.
    async fn append_message(
        &self,
        chat_id: &str,
        sender: Sender,
        content: &str,
    ) -> Result<Message, AppError>;

    /// Messages in accept order, `None` for an unknown chat.
    async fn list_messages(&self, chat_id: &str) -> Result<Option<Vec<Message>>, AppError>;

    /// Sessions ordered by `updated_at` descending.
    async fn list_sessions(
        &self,
        status: Option<ChatStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ChatSession>, AppError>;

    async fn update_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<Option<ChatSession>, AppError>;

    async fn insert_rating(&self, rating: &Rating) -> Result<(), AppError>;

    /// Ratings, newest first.
    async fn list_ratings(&self) -> Result<Vec<Rating>, AppError>;
}

#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn create_contact(&self, contact: NewContact) -> Result<ContactMessage, AppError>;

    /// Contact messages, newest first.
    async fn list_contacts(
        &self,
        status: Option<ContactStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ContactMessage>, AppError>;

    async fn update_contact(
        &self,
        contact_id: &str,
        status: Option<ContactStatus>,
        priority: Option<ContactPriority>,
    ) -> Result<Option<ContactMessage>, AppError>;

    /// Appends a reply and marks the contact `replied`.
    async fn add_contact_reply(
        &self,
        contact_id: &str,
        reply: ContactReply,
    ) -> Result<Option<ContactMessage>, AppError>;
}

/// Read flags keyed by synthetic notification id, kept apart from the chat
/// and contact records they describe.
#[async_trait]
pub trait ReadStateStore: Send + Sync {
    async fn read_state(&self) -> Result<NotificationReadState, AppError>;

    async fn mark_read(&self, id: &NotificationId) -> Result<(), AppError>;

    /// Flags every id in `ids` as read and raises the global override.
    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), AppError>;
}

pub trait Store: ChatStore + ContactStore + ReadStateStore {}

impl<T: ChatStore + ContactStore + ReadStateStore> Store for T {}
