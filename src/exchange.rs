//! Message exchange engine: session creation, appends, polling reads,
//! status changes and rating capture on top of a [`Store`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::AppError;
use crate::store::Store;
use crate::types::{
    ChatSession, ChatStatus, CreatedSession, Message, Rating, RatingStats, Sender, SessionOrigin,
    GUEST_EMAIL, GUEST_NAME,
};

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn Store>,
}

impl Engine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Always issues a fresh chat id. Reuse across reloads is the caller's
    /// job; `existing` only signals that this identity chatted before.
    pub async fn create_session(
        &self,
        user_email: Option<&str>,
        user_name: Option<&str>,
    ) -> Result<CreatedSession, AppError> {
        let email = non_empty(user_email).unwrap_or(GUEST_EMAIL);
        let name = non_empty(user_name).unwrap_or(GUEST_NAME);

        let origin = if email != GUEST_EMAIL && self.store.count_sessions_for(email).await? > 0 {
            SessionOrigin::Existing
        } else {
            SessionOrigin::Created
        };
        let session = self.store.create_session(email, name).await?;
        info!(chat_id = %session.id, user_email = email, ?origin, "chat session created");

        Ok(CreatedSession {
            chat_id: session.id,
            status: origin,
        })
    }

    pub async fn append_message(
        &self,
        chat_id: &str,
        content: &str,
        sender: Sender,
    ) -> Result<Message, AppError> {
        let chat_id = required_chat_id(chat_id)?;
        let content = content.trim();
        if content.is_empty() {
            return Err(AppError::Validation("content is required".into()));
        }

        let message = self.store.append_message(chat_id, sender, content).await?;
        debug!(chat_id, sender = sender.as_str(), message_id = %message.id, "message appended");
        Ok(message)
    }

    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, AppError> {
        let chat_id = required_chat_id(chat_id)?;
        self.store
            .list_messages(chat_id)
            .await?
            .ok_or_else(|| AppError::ChatNotFound(chat_id.to_string()))
    }

    pub async fn list_chats(
        &self,
        status: Option<ChatStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ChatSession>, AppError> {
        self.store.list_sessions(status, limit).await
    }

    pub async fn update_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<ChatSession, AppError> {
        let chat_id = required_chat_id(chat_id)?;
        let session = self
            .store
            .update_status(chat_id, status)
            .await?
            .ok_or_else(|| AppError::ChatNotFound(chat_id.to_string()))?;
        info!(chat_id, status = %status, "chat status updated");
        Ok(session)
    }

    /// Visitor-side closure. Closing an already closed chat leaves it untouched.
    pub async fn close(&self, chat_id: &str) -> Result<ChatSession, AppError> {
        self.update_status(chat_id, ChatStatus::Closed).await
    }

    /// Records a 1-5 star rating for an existing chat. Uniqueness per chat is
    /// not enforced here; clients keep their own submitted marker.
    pub async fn submit_rating(
        &self,
        chat_id: &str,
        rating: u8,
        comment: Option<&str>,
        user_email: Option<&str>,
    ) -> Result<Rating, AppError> {
        let chat_id = required_chat_id(chat_id)?;
        if !(1..=5).contains(&rating) {
            return Err(AppError::InvalidRating(rating));
        }
        let session = self
            .store
            .get_session(chat_id)
            .await?
            .ok_or_else(|| AppError::ChatNotFound(chat_id.to_string()))?;

        let record = Rating {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            rating,
            comment: non_empty(comment).map(str::to_string),
            user_email: non_empty(user_email)
                .map(str::to_string)
                .unwrap_or(session.user_email),
            created_at: Utc::now(),
        };
        self.store.insert_rating(&record).await?;
        info!(chat_id, rating, "chat rated");
        Ok(record)
    }

    pub async fn ratings(&self) -> Result<(Vec<Rating>, RatingStats), AppError> {
        let ratings = self.store.list_ratings().await?;
        let stats = RatingStats::from_ratings(&ratings);
        Ok((ratings, stats))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn required_chat_id(chat_id: &str) -> Result<&str, AppError> {
    let chat_id = chat_id.trim();
    if chat_id.is_empty() {
        return Err(AppError::Validation("chatId is required".into()));
    }
    Ok(chat_id)
}
