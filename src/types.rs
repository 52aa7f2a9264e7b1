use std::{collections::BTreeMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

pub const GUEST_EMAIL: &str = "guest@anonymous.local";
pub const GUEST_NAME: &str = "Guest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Support,
    Bot,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Support => "support",
            Sender::Bot => "bot",
        }
    }
}

impl FromStr for Sender {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "user" => Ok(Sender::User),
            "support" => Ok(Sender::Support),
            "bot" => Ok(Sender::Bot),
            other => Err(AppError::Validation(format!("unknown sender '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    Active,
    Waiting,
    Closed,
}

impl ChatStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatStatus::Active => "active",
            ChatStatus::Waiting => "waiting",
            ChatStatus::Closed => "closed",
        }
    }

    /// Status a session moves to once a message from `sender` is accepted.
    ///
    /// Visitors cannot write into a closed session. Support and bot messages
    /// are still recorded there (farewell and thank-you texts) but never
    /// reopen it.
    pub fn after_message(self, sender: Sender) -> Result<ChatStatus, AppError> {
        match (self, sender) {
            (ChatStatus::Closed, Sender::User) => Err(AppError::ChatClosed),
            (ChatStatus::Closed, _) => Ok(ChatStatus::Closed),
            (_, Sender::User) => Ok(ChatStatus::Waiting),
            (ChatStatus::Waiting, Sender::Support) => Ok(ChatStatus::Active),
            (status, _) => Ok(status),
        }
    }
}

impl FromStr for ChatStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(ChatStatus::Active),
            "waiting" => Ok(ChatStatus::Waiting),
            "closed" => Ok(ChatStatus::Closed),
            other => Err(AppError::Validation(format!("unknown chat status '{other}'"))),
        }
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery label carried on a message. Stored messages are always `sent`;
/// `sending` only ever exists in a client's optimistic copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
        }
    }
}

impl FromStr for MessageStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sending" => Ok(MessageStatus::Sending),
            "sent" => Ok(MessageStatus::Sent),
            "delivered" => Ok(MessageStatus::Delivered),
            "read" => Ok(MessageStatus::Read),
            other => Err(AppError::Internal(format!("unknown message status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub user_email: String,
    pub user_name: String,
    pub status: ChatStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ChatSession {
    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    Created,
    Existing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub chat_id: String,
    pub status: SessionOrigin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rating {
    pub id: String,
    pub chat_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    pub user_email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingStats {
    pub total: usize,
    pub average: f64,
    pub distribution: BTreeMap<u8, usize>,
}

impl RatingStats {
    pub fn from_ratings(ratings: &[Rating]) -> Self {
        let mut distribution: BTreeMap<u8, usize> = (1..=5).map(|star| (star, 0)).collect();
        let mut sum = 0u64;
        for rating in ratings {
            *distribution.entry(rating.rating).or_default() += 1;
            sum += u64::from(rating.rating);
        }
        let total = ratings.len();
        let average = if total == 0 {
            0.0
        } else {
            ((sum as f64 / total as f64) * 100.0).round() / 100.0
        };
        Self {
            total,
            average,
            distribution,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactPriority {
    Low,
    Medium,
    High,
}

impl ContactPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            ContactPriority::Low => "low",
            ContactPriority::Medium => "medium",
            ContactPriority::High => "high",
        }
    }
}

impl FromStr for ContactPriority {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ContactPriority::Low),
            "medium" => Ok(ContactPriority::Medium),
            "high" => Ok(ContactPriority::High),
            other => Err(AppError::Validation(format!("unknown priority '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactStatus {
    New,
    Read,
    Replied,
    Closed,
}

impl ContactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContactStatus::New => "new",
            ContactStatus::Read => "read",
            ContactStatus::Replied => "replied",
            ContactStatus::Closed => "closed",
        }
    }
}

impl FromStr for ContactStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(ContactStatus::New),
            "read" => Ok(ContactStatus::Read),
            "replied" => Ok(ContactStatus::Replied),
            "closed" => Ok(ContactStatus::Closed),
            other => Err(AppError::Validation(format!("unknown contact status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactReply {
    pub id: String,
    pub message: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactMessage {
    pub id: String,
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
    pub priority: ContactPriority,
    pub status: ContactStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub replies: Vec<ContactReply>,
}

/// Fields accepted when a contact message is filed.
#[derive(Debug, Clone)]
pub struct NewContact {
    pub name: String,
    pub email: String,
    pub subject: String,
    pub message: String,
    pub priority: ContactPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Chat,
    Contact,
}

/// Synthetic notification identity: `chat-<chatId>` or `contact-<contactId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId {
    pub kind: NotificationKind,
    pub source_id: String,
}

impl NotificationId {
    pub fn chat(chat_id: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Chat,
            source_id: chat_id.into(),
        }
    }

    pub fn contact(contact_id: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Contact,
            source_id: contact_id.into(),
        }
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NotificationKind::Chat => write!(f, "chat-{}", self.source_id),
            NotificationKind::Contact => write!(f, "contact-{}", self.source_id),
        }
    }
}

impl FromStr for NotificationId {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let parsed = if let Some(rest) = value.strip_prefix("chat-") {
            Some(NotificationId::chat(rest))
        } else {
            value.strip_prefix("contact-").map(NotificationId::contact)
        };
        match parsed {
            Some(id) if !id.source_id.is_empty() => Ok(id),
            _ => Err(AppError::InvalidNotificationId(value.to_string())),
        }
    }
}

impl Serialize for NotificationId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NotificationId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadFlag {
    pub read: bool,
}

/// Key of the global override inside the read-state map.
pub const MARK_ALL_READ_KEY: &str = "_markAllRead";

/// Side table of per-notification read flags plus the global override.
/// On the wire both live in one map:
/// `{"notifications": {"chat-1": {"read": true}, "_markAllRead": true}}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationReadState {
    pub notifications: BTreeMap<NotificationId, ReadFlag>,
    pub mark_all_read: bool,
}

#[derive(Serialize, Deserialize)]
struct ReadStateWire {
    #[serde(default)]
    notifications: BTreeMap<String, serde_json::Value>,
}

impl Serialize for NotificationReadState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut notifications = self
            .notifications
            .iter()
            .map(|(id, flag)| (id.to_string(), serde_json::json!({ "read": flag.read })))
            .collect::<BTreeMap<_, _>>();
        if self.mark_all_read {
            notifications.insert(MARK_ALL_READ_KEY.to_string(), serde_json::Value::Bool(true));
        }
        ReadStateWire { notifications }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NotificationReadState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;

        let wire = ReadStateWire::deserialize(deserializer)?;
        let mut state = NotificationReadState::default();
        for (key, value) in wire.notifications {
            if key == MARK_ALL_READ_KEY {
                state.mark_all_read = value.as_bool().unwrap_or(false);
                continue;
            }
            let id = key.parse::<NotificationId>().map_err(D::Error::custom)?;
            let flag = ReadFlag::deserialize(value).map_err(D::Error::custom)?;
            state.notifications.insert(id, flag);
        }
        Ok(state)
    }
}

impl NotificationReadState {
    pub fn is_read(&self, id: &NotificationId) -> bool {
        self.mark_all_read || self.notifications.get(id).map(|f| f.read).unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub source_id: String,
    pub title: String,
    pub preview: String,
    pub timestamp: DateTime<Utc>,
    pub read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<ContactPriority>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFeed {
    pub notifications: Vec<Notification>,
    pub unread_count: usize,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub content: String,
    pub sender: Sender,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIdQuery {
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChatBody {
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RatingBody {
    #[serde(default)]
    pub chat_id: String,
    pub rating: u8,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadBody {
    pub notification_id: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAllReadBody {
    #[serde(default)]
    pub notification_ids: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChatBody {
    #[serde(default)]
    pub chat_id: String,
    pub status: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactListQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContactBody {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContactBody {
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactReplyBody {
    #[serde(default)]
    pub contact_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<String>,
}
