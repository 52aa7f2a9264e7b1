//! Transports used by the visitor widget and the admin console: an HTTP
//! client for the deployed service and an in-process one over [`AppState`].

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::app::AppState;
use crate::error::AppError;
use crate::types::{
    ChatSession, ChatStatus, ContactMessage, ContactReply, ContactStatus, CreatedSession, Message,
    NotificationId, NotificationReadState, Rating, RatingStats, Sender,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server responded {status}: {message}")]
    Status { status: u16, message: String },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }
}

impl From<AppError> for ClientError {
    fn from(err: AppError) -> Self {
        ClientError::Status {
            status: err.status_code().as_u16(),
            message: err.to_string(),
        }
    }
}

/// Calls the visitor chat surface makes.
#[async_trait]
pub trait SupportApi: Send + Sync {
    async fn create_session(
        &self,
        user_email: &str,
        user_name: &str,
    ) -> Result<CreatedSession, ClientError>;

    async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        sender: Sender,
    ) -> Result<Message, ClientError>;

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, ClientError>;

    async fn close_chat(&self, chat_id: &str) -> Result<(), ClientError>;

    async fn submit_rating(
        &self,
        chat_id: &str,
        rating: u8,
        comment: Option<&str>,
        user_email: &str,
    ) -> Result<Rating, ClientError>;
}

/// Calls the admin support console makes.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn list_chats(&self, status: Option<ChatStatus>) -> Result<Vec<ChatSession>, ClientError>;

    async fn update_chat_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<ChatSession, ClientError>;

    async fn reply_to_chat(&self, chat_id: &str, content: &str) -> Result<Message, ClientError>;

    async fn list_contacts(
        &self,
        status: Option<ContactStatus>,
    ) -> Result<Vec<ContactMessage>, ClientError>;

    async fn update_contact_status(
        &self,
        contact_id: &str,
        status: ContactStatus,
    ) -> Result<ContactMessage, ClientError>;

    async fn reply_to_contact(
        &self,
        contact_id: &str,
        message: &str,
    ) -> Result<ContactMessage, ClientError>;

    async fn ratings(&self) -> Result<(Vec<Rating>, RatingStats), ClientError>;

    async fn read_state(&self) -> Result<NotificationReadState, ClientError>;

    async fn mark_read(&self, id: &NotificationId) -> Result<(), ClientError>;

    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), ClientError>;
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    messages: Vec<Message>,
}

#[derive(Deserialize)]
struct MessageEnvelope {
    message: Message,
}

#[derive(Deserialize)]
struct RatingEnvelope {
    rating: Rating,
}

#[derive(Deserialize)]
struct RatingsEnvelope {
    ratings: Vec<Rating>,
    stats: RatingStats,
}

#[derive(Deserialize)]
struct ChatsEnvelope {
    chats: Vec<ChatSession>,
}

#[derive(Deserialize)]
struct ChatEnvelope {
    chat: ChatSession,
}

#[derive(Deserialize)]
struct ContactsEnvelope {
    contacts: Vec<ContactMessage>,
}

#[derive(Deserialize)]
struct ContactEnvelope {
    contact: ContactMessage,
}

#[derive(Clone)]
pub struct HttpClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, ClientError> {
        let response = self.http.get(self.url(path)).query(query).send().await?;
        decode(response).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> Result<T, ClientError> {
        let response = self.http.post(self.url(path)).json(&body).send().await?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        message: error_message(status, &body),
    })
}

fn error_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string()
        })
}

#[async_trait]
impl SupportApi for HttpClient {
    async fn create_session(
        &self,
        user_email: &str,
        user_name: &str,
    ) -> Result<CreatedSession, ClientError> {
        self.post(
            "/api/chat/create",
            json!({ "userEmail": user_email, "userName": user_name }),
        )
        .await
    }

    async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        sender: Sender,
    ) -> Result<Message, ClientError> {
        let envelope: MessageEnvelope = self
            .post(
                "/api/chat/send",
                json!({ "chatId": chat_id, "content": content, "sender": sender }),
            )
            .await?;
        Ok(envelope.message)
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, ClientError> {
        let envelope: MessagesEnvelope = self.get("/api/chat/send", &[("chatId", chat_id)]).await?;
        Ok(envelope.messages)
    }

    async fn close_chat(&self, chat_id: &str) -> Result<(), ClientError> {
        let _: Value = self
            .post("/api/chat/close", json!({ "chatId": chat_id }))
            .await?;
        Ok(())
    }

    async fn submit_rating(
        &self,
        chat_id: &str,
        rating: u8,
        comment: Option<&str>,
        user_email: &str,
    ) -> Result<Rating, ClientError> {
        let envelope: RatingEnvelope = self
            .post(
                "/api/chat/rating",
                json!({
                    "chatId": chat_id,
                    "rating": rating,
                    "comment": comment.unwrap_or_default(),
                    "userEmail": user_email
                }),
            )
            .await?;
        Ok(envelope.rating)
    }
}

#[async_trait]
impl AdminApi for HttpClient {
    async fn list_chats(&self, status: Option<ChatStatus>) -> Result<Vec<ChatSession>, ClientError> {
        let query = status
            .map(|s| vec![("status", s.as_str())])
            .unwrap_or_default();
        let envelope: ChatsEnvelope = self.get("/api/admin/chats", &query).await?;
        Ok(envelope.chats)
    }

    async fn update_chat_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<ChatSession, ClientError> {
        let envelope: ChatEnvelope = self
            .post(
                "/api/admin/chats/update",
                json!({ "chatId": chat_id, "status": status }),
            )
            .await?;
        Ok(envelope.chat)
    }

    async fn reply_to_chat(&self, chat_id: &str, content: &str) -> Result<Message, ClientError> {
        self.send_message(chat_id, content, Sender::Support).await
    }

    async fn list_contacts(
        &self,
        status: Option<ContactStatus>,
    ) -> Result<Vec<ContactMessage>, ClientError> {
        let query = status
            .map(|s| vec![("status", s.as_str())])
            .unwrap_or_default();
        let envelope: ContactsEnvelope = self.get("/api/contact", &query).await?;
        Ok(envelope.contacts)
    }

    async fn update_contact_status(
        &self,
        contact_id: &str,
        status: ContactStatus,
    ) -> Result<ContactMessage, ClientError> {
        let envelope: ContactEnvelope = self
            .post(
                "/api/contact/update",
                json!({ "contactId": contact_id, "status": status }),
            )
            .await?;
        Ok(envelope.contact)
    }

    async fn reply_to_contact(
        &self,
        contact_id: &str,
        message: &str,
    ) -> Result<ContactMessage, ClientError> {
        let envelope: ContactEnvelope = self
            .post(
                "/api/contact/reply",
                json!({ "contactId": contact_id, "message": message }),
            )
            .await?;
        Ok(envelope.contact)
    }

    async fn ratings(&self) -> Result<(Vec<Rating>, RatingStats), ClientError> {
        let envelope: RatingsEnvelope = self.get("/api/chat/rating", &[]).await?;
        Ok((envelope.ratings, envelope.stats))
    }

    async fn read_state(&self) -> Result<NotificationReadState, ClientError> {
        self.get("/api/notifications/status", &[]).await
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<(), ClientError> {
        let _: Value = self
            .post(
                "/api/notifications/mark-read",
                json!({ "notificationId": id }),
            )
            .await?;
        Ok(())
    }

    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), ClientError> {
        let _: Value = self
            .post(
                "/api/notifications/mark-all-read",
                json!({ "notificationIds": ids }),
            )
            .await?;
        Ok(())
    }
}

/// Same calls served in-process, for embedding the widget or console next
/// to the service without a network hop.
#[derive(Clone)]
pub struct LocalClient {
    state: Arc<AppState>,
}

impl LocalClient {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl SupportApi for LocalClient {
    async fn create_session(
        &self,
        user_email: &str,
        user_name: &str,
    ) -> Result<CreatedSession, ClientError> {
        Ok(self
            .state
            .engine
            .create_session(Some(user_email), Some(user_name))
            .await?)
    }

    async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        sender: Sender,
    ) -> Result<Message, ClientError> {
        Ok(self
            .state
            .engine
            .append_message(chat_id, content, sender)
            .await?)
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, ClientError> {
        Ok(self.state.engine.list_messages(chat_id).await?)
    }

    async fn close_chat(&self, chat_id: &str) -> Result<(), ClientError> {
        self.state.engine.close(chat_id).await?;
        Ok(())
    }

    async fn submit_rating(
        &self,
        chat_id: &str,
        rating: u8,
        comment: Option<&str>,
        user_email: &str,
    ) -> Result<Rating, ClientError> {
        Ok(self
            .state
            .engine
            .submit_rating(chat_id, rating, comment, Some(user_email))
            .await?)
    }
}

#[async_trait]
impl AdminApi for LocalClient {
    async fn list_chats(&self, status: Option<ChatStatus>) -> Result<Vec<ChatSession>, ClientError> {
        Ok(self.state.engine.list_chats(status, None).await?)
    }

    async fn update_chat_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<ChatSession, ClientError> {
        Ok(self.state.engine.update_status(chat_id, status).await?)
    }

    async fn reply_to_chat(&self, chat_id: &str, content: &str) -> Result<Message, ClientError> {
        self.send_message(chat_id, content, Sender::Support).await
    }

    async fn list_contacts(
        &self,
        status: Option<ContactStatus>,
    ) -> Result<Vec<ContactMessage>, ClientError> {
        Ok(self.state.engine.store().list_contacts(status, None).await?)
    }

    async fn update_contact_status(
        &self,
        contact_id: &str,
        status: ContactStatus,
    ) -> Result<ContactMessage, ClientError> {
        self.state
            .engine
            .store()
            .update_contact(contact_id, Some(status), None)
            .await?
            .ok_or_else(|| AppError::ContactNotFound(contact_id.to_string()).into())
    }

    async fn reply_to_contact(
        &self,
        contact_id: &str,
        message: &str,
    ) -> Result<ContactMessage, ClientError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AppError::Validation("message is required".into()).into());
        }
        let reply = ContactReply {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.to_string(),
            author: "support".to_string(),
            created_at: chrono::Utc::now(),
        };
        self.state
            .engine
            .store()
            .add_contact_reply(contact_id, reply)
            .await?
            .ok_or_else(|| AppError::ContactNotFound(contact_id.to_string()).into())
    }

    async fn ratings(&self) -> Result<(Vec<Rating>, RatingStats), ClientError> {
        Ok(self.state.engine.ratings().await?)
    }

    async fn read_state(&self) -> Result<NotificationReadState, ClientError> {
        Ok(self.state.notifier.read_state().await?)
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<(), ClientError> {
        self.state.notifier.mark_as_read(&id.to_string()).await?;
        Ok(())
    }

    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), ClientError> {
        let known = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
        self.state.notifier.mark_all_as_read(&known).await?;
        Ok(())
    }
}
