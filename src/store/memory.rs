use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ChatStore, ContactStore, ReadStateStore};
use crate::error::AppError;
use crate::types::{
    ChatSession, ChatStatus, ContactMessage, ContactPriority, ContactReply, ContactStatus, Message,
    MessageStatus, NewContact, NotificationId, NotificationReadState, Rating, ReadFlag, Sender,
};

/// Process-local store. Every mutation takes the write lock for the whole
/// step, so concurrent appends to one chat are serialized in accept order.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, ChatSession>>,
    ratings: RwLock<Vec<Rating>>,
    contacts: RwLock<HashMap<String, ContactMessage>>,
    read_state: RwLock<NotificationReadState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn create_session(
        &self,
        user_email: &str,
        user_name: &str,
    ) -> Result<ChatSession, AppError> {
        let now = Utc::now();
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            user_email: user_email.to_string(),
            user_name: user_name.to_string(),
            status: ChatStatus::Active,
            created_at: now,
            updated_at: now,
            messages: vec![],
        };
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, chat_id: &str) -> Result<Option<ChatSession>, AppError> {
        Ok(self.sessions.read().await.get(chat_id).cloned())
    }

    async fn count_sessions_for(&self, user_email: &str) -> Result<usize, AppError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| s.user_email == user_email)
            .count())
    }

    async fn append_message(
        &self,
        chat_id: &str,
        sender: Sender,
        content: &str,
    ) -> Result<Message, AppError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(chat_id)
            .ok_or_else(|| AppError::ChatNotFound(chat_id.to_string()))?;
        let next_status = session.status.after_message(sender)?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            sender,
            timestamp: Utc::now(),
            status: MessageStatus::Sent,
        };
        session.status = next_status;
        session.updated_at = message.timestamp;
        session.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Option<Vec<Message>>, AppError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(chat_id)
            .map(|s| s.messages.clone()))
    }

    async fn list_sessions(
        &self,
        status: Option<ChatStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ChatSession>, AppError> {
        let mut list = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| status.map_or(true, |wanted| s.status == wanted))
                .cloned()
                .collect::<Vec<_>>()
        };
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        if let Some(limit) = limit {
            list.truncate(limit);
        }
        Ok(list)
    }

    async fn update_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<Option<ChatSession>, AppError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.get_mut(chat_id) else {
            return Ok(None);
        };
        if session.status != status {
            session.status = status;
            session.updated_at = Utc::now();
        }
        Ok(Some(session.clone()))
    }

    async fn insert_rating(&self, rating: &Rating) -> Result<(), AppError> {
        self.ratings.write().await.push(rating.clone());
        Ok(())
    }

    async fn list_ratings(&self) -> Result<Vec<Rating>, AppError> {
        let mut ratings = self.ratings.read().await.clone();
        ratings.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(ratings)
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn create_contact(&self, contact: NewContact) -> Result<ContactMessage, AppError> {
        let now = Utc::now();
        let record = ContactMessage {
            id: Uuid::new_v4().to_string(),
            name: contact.name,
            email: contact.email,
            subject: contact.subject,
            message: contact.message,
            priority: contact.priority,
            status: ContactStatus::New,
            created_at: now,
            updated_at: now,
            replies: vec![],
        };
        self.contacts
            .write()
            .await
            .insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn list_contacts(
        &self,
        status: Option<ContactStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ContactMessage>, AppError> {
        let mut list = {
            let contacts = self.contacts.read().await;
            contacts
                .values()
                .filter(|c| status.map_or(true, |wanted| c.status == wanted))
                .cloned()
                .collect::<Vec<_>>()
        };
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit {
            list.truncate(limit);
        }
        Ok(list)
    }

    async fn update_contact(
        &self,
        contact_id: &str,
        status: Option<ContactStatus>,
        priority: Option<ContactPriority>,
    ) -> Result<Option<ContactMessage>, AppError> {
        let mut contacts = self.contacts.write().await;
        let Some(contact) = contacts.get_mut(contact_id) else {
            return Ok(None);
        };
        if let Some(status) = status {
            contact.status = status;
        }
        if let Some(priority) = priority {
            contact.priority = priority;
        }
        contact.updated_at = Utc::now();
        Ok(Some(contact.clone()))
    }

    async fn add_contact_reply(
        &self,
        contact_id: &str,
        reply: ContactReply,
    ) -> Result<Option<ContactMessage>, AppError> {
        let mut contacts = self.contacts.write().await;
        let Some(contact) = contacts.get_mut(contact_id) else {
            return Ok(None);
        };
        contact.updated_at = reply.created_at;
        contact.status = ContactStatus::Replied;
        contact.replies.push(reply);
        Ok(Some(contact.clone()))
    }
}

#[async_trait]
impl ReadStateStore for MemoryStore {
    async fn read_state(&self) -> Result<NotificationReadState, AppError> {
        Ok(self.read_state.read().await.clone())
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<(), AppError> {
        self.read_state
            .write()
            .await
            .notifications
            .insert(id.clone(), ReadFlag { read: true });
        Ok(())
    }

    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), AppError> {
        let mut state = self.read_state.write().await;
        for id in ids {
            state.notifications.insert(id.clone(), ReadFlag { read: true });
        }
        state.mark_all_read = true;
        Ok(())
    }
}
