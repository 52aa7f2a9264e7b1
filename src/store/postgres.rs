use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{ChatStore, ContactStore, ReadStateStore};
use crate::error::AppError;
use crate::types::{
    ChatSession, ChatStatus, ContactMessage, ContactPriority, ContactReply, ContactStatus, Message,
    MessageStatus, NewContact, NotificationId, NotificationReadState, Rating, ReadFlag, Sender,
    MARK_ALL_READ_KEY,
};

const SESSION_COLUMNS: &str = "id, user_email, user_name, status, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, content, sender, status, created_at";
const CONTACT_COLUMNS: &str =
    "id, name, email, subject, message, priority, status, created_at, updated_at";

/// TIMESTAMPTZ keeps microseconds, so values handed back to callers are
/// truncated to match what a later read returns.
fn db_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn messages_for(&self, chat_ids: &[String]) -> Result<HashMap<String, Vec<Message>>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = ANY($1) ORDER BY seq ASC"
        ))
        .bind(chat_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<Message>> = HashMap::new();
        for row in rows {
            let message = parse_message(&row)?;
            grouped
                .entry(message.chat_id.clone())
                .or_default()
                .push(message);
        }
        Ok(grouped)
    }

    async fn replies_for(
        &self,
        contact_ids: &[String],
    ) -> Result<HashMap<String, Vec<ContactReply>>, AppError> {
        let rows = sqlx::query(
            "SELECT id, contact_id, message, author, created_at FROM contact_replies \
             WHERE contact_id = ANY($1) ORDER BY seq ASC",
        )
        .bind(contact_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<ContactReply>> = HashMap::new();
        for row in rows {
            let contact_id: String = row.try_get("contact_id")?;
            grouped.entry(contact_id).or_default().push(ContactReply {
                id: row.try_get("id")?,
                message: row.try_get("message")?,
                author: row.try_get("author")?,
                created_at: row.try_get("created_at")?,
            });
        }
        Ok(grouped)
    }

    async fn with_messages(&self, rows: Vec<PgRow>) -> Result<Vec<ChatSession>, AppError> {
        let mut sessions = rows
            .iter()
            .map(parse_session)
            .collect::<Result<Vec<_>, _>>()?;
        let ids = sessions.iter().map(|s| s.id.clone()).collect::<Vec<_>>();
        let mut messages = self.messages_for(&ids).await?;
        for session in &mut sessions {
            session.messages = messages.remove(&session.id).unwrap_or_default();
        }
        Ok(sessions)
    }

    async fn with_replies(&self, rows: Vec<PgRow>) -> Result<Vec<ContactMessage>, AppError> {
        let mut contacts = rows
            .iter()
            .map(parse_contact)
            .collect::<Result<Vec<_>, _>>()?;
        let ids = contacts.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        let mut replies = self.replies_for(&ids).await?;
        for contact in &mut contacts {
            contact.replies = replies.remove(&contact.id).unwrap_or_default();
        }
        Ok(contacts)
    }

    async fn fetch_contact(&self, contact_id: &str) -> Result<Option<ContactMessage>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contact_messages WHERE id = $1"
        ))
        .bind(contact_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.with_replies(rows).await?.into_iter().next())
    }
}

fn parse_session(row: &PgRow) -> Result<ChatSession, AppError> {
    Ok(ChatSession {
        id: row.try_get("id")?,
        user_email: row.try_get("user_email")?,
        user_name: row.try_get("user_name")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        messages: vec![],
    })
}

fn parse_message(row: &PgRow) -> Result<Message, AppError> {
    let sender = row
        .try_get::<String, _>("sender")?
        .parse::<Sender>()
        .map_err(|e| AppError::Internal(e.to_string()))?;
    Ok(Message {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        content: row.try_get("content")?,
        sender,
        timestamp: row.try_get("created_at")?,
        status: row.try_get::<String, _>("status")?.parse()?,
    })
}

fn parse_contact(row: &PgRow) -> Result<ContactMessage, AppError> {
    Ok(ContactMessage {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        subject: row.try_get("subject")?,
        message: row.try_get("message")?,
        priority: row.try_get::<String, _>("priority")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        replies: vec![],
    })
}

fn parse_rating(row: &PgRow) -> Result<Rating, AppError> {
    let stars: i16 = row.try_get("rating")?;
    Ok(Rating {
        id: row.try_get("id")?,
        chat_id: row.try_get("chat_id")?,
        rating: u8::try_from(stars)
            .map_err(|_| AppError::Internal(format!("stored rating out of range: {stars}")))?,
        comment: row.try_get("comment")?,
        user_email: row.try_get("user_email")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl ChatStore for PgStore {
    async fn create_session(
        &self,
        user_email: &str,
        user_name: &str,
    ) -> Result<ChatSession, AppError> {
        let now = db_now();
        let session = ChatSession {
            id: Uuid::new_v4().to_string(),
            user_email: user_email.to_string(),
            user_name: user_name.to_string(),
            status: ChatStatus::Active,
            created_at: now,
            updated_at: now,
            messages: vec![],
        };
        sqlx::query(
            "INSERT INTO chat_sessions (id, user_email, user_name, status, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&session.id)
        .bind(&session.user_email)
        .bind(&session.user_name)
        .bind(session.status.as_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(session)
    }

    async fn get_session(&self, chat_id: &str) -> Result<Option<ChatSession>, AppError> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = $1"
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(self.with_messages(rows).await?.into_iter().next())
    }

    async fn count_sessions_for(&self, user_email: &str) -> Result<usize, AppError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(1) FROM chat_sessions WHERE user_email = $1",
        )
        .bind(user_email)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }

    async fn append_message(
        &self,
        chat_id: &str,
        sender: Sender,
        content: &str,
    ) -> Result<Message, AppError> {
        let mut tx = self.pool.begin().await?;

        let current = sqlx::query_scalar::<_, String>(
            "SELECT status FROM chat_sessions WHERE id = $1 FOR UPDATE",
        )
        .bind(chat_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::ChatNotFound(chat_id.to_string()))?;
        let next_status = current.parse::<ChatStatus>()?.after_message(sender)?;

        let message = Message {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            sender,
            timestamp: db_now(),
            status: MessageStatus::Sent,
        };
        sqlx::query(
            "INSERT INTO chat_messages (id, chat_id, content, sender, status, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.content)
        .bind(message.sender.as_str())
        .bind(message.status.as_str())
        .bind(message.timestamp)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE chat_sessions SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(next_status.as_str())
            .bind(message.timestamp)
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(message)
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Option<Vec<Message>>, AppError> {
        let exists =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM chat_sessions WHERE id = $1")
                .bind(chat_id)
                .fetch_one(&self.pool)
                .await?
                > 0;
        if !exists {
            return Ok(None);
        }
        let mut grouped = self.messages_for(&[chat_id.to_string()]).await?;
        Ok(Some(grouped.remove(chat_id).unwrap_or_default()))
    }

    async fn list_sessions(
        &self,
        status: Option<ChatStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ChatSession>, AppError> {
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM chat_sessions \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY updated_at DESC LIMIT $2"
        ))
        .bind(status.map(ChatStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.with_messages(rows).await
    }

    async fn update_status(
        &self,
        chat_id: &str,
        status: ChatStatus,
    ) -> Result<Option<ChatSession>, AppError> {
        let updated = sqlx::query(
            "UPDATE chat_sessions \
             SET updated_at = CASE WHEN status = $1 THEN updated_at ELSE $2 END, status = $1 \
             WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(db_now())
        .bind(chat_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(None);
        }
        self.get_session(chat_id).await
    }

    async fn insert_rating(&self, rating: &Rating) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO chat_ratings (id, chat_id, rating, comment, user_email, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6)",
        )
        .bind(&rating.id)
        .bind(&rating.chat_id)
        .bind(i16::from(rating.rating))
        .bind(&rating.comment)
        .bind(&rating.user_email)
        .bind(rating.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_ratings(&self) -> Result<Vec<Rating>, AppError> {
        let rows = sqlx::query(
            "SELECT id, chat_id, rating, comment, user_email, created_at FROM chat_ratings \
             ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_rating).collect()
    }
}

#[async_trait]
impl ContactStore for PgStore {
    async fn create_contact(&self, contact: NewContact) -> Result<ContactMessage, AppError> {
        let now = db_now();
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
        sqlx::query(&format!(
            "INSERT INTO contact_messages ({CONTACT_COLUMNS}) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)"
        ))
        .bind(&record.id)
        .bind(&record.name)
        .bind(&record.email)
        .bind(&record.subject)
        .bind(&record.message)
        .bind(record.priority.as_str())
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_contacts(
        &self,
        status: Option<ContactStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<ContactMessage>, AppError> {
        let limit = limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contact_messages \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC LIMIT $2"
        ))
        .bind(status.map(ContactStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        self.with_replies(rows).await
    }

    async fn update_contact(
        &self,
        contact_id: &str,
        status: Option<ContactStatus>,
        priority: Option<ContactPriority>,
    ) -> Result<Option<ContactMessage>, AppError> {
        let updated = sqlx::query(
            "UPDATE contact_messages \
             SET status = COALESCE($1, status), priority = COALESCE($2, priority), updated_at = $3 \
             WHERE id = $4",
        )
        .bind(status.map(ContactStatus::as_str))
        .bind(priority.map(ContactPriority::as_str))
        .bind(db_now())
        .bind(contact_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(None);
        }
        self.fetch_contact(contact_id).await
    }

    async fn add_contact_reply(
        &self,
        contact_id: &str,
        reply: ContactReply,
    ) -> Result<Option<ContactMessage>, AppError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE contact_messages SET status = $1, updated_at = $2 WHERE id = $3",
        )
        .bind(ContactStatus::Replied.as_str())
        .bind(reply.created_at)
        .bind(contact_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Ok(None);
        }
        sqlx::query(
            "INSERT INTO contact_replies (id, contact_id, message, author, created_at) \
             VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(&reply.id)
        .bind(contact_id)
        .bind(&reply.message)
        .bind(&reply.author)
        .bind(reply.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.fetch_contact(contact_id).await
    }
}

#[async_trait]
impl ReadStateStore for PgStore {
    async fn read_state(&self) -> Result<NotificationReadState, AppError> {
        let rows = sqlx::query("SELECT notification_id, read FROM notification_read_state")
            .fetch_all(&self.pool)
            .await?;

        let mut state = NotificationReadState::default();
        for row in rows {
            let key: String = row.try_get("notification_id")?;
            let read: bool = row.try_get("read")?;
            if key == MARK_ALL_READ_KEY {
                state.mark_all_read = read;
                continue;
            }
            match key.parse::<NotificationId>() {
                Ok(id) => {
                    state.notifications.insert(id, ReadFlag { read });
                }
                Err(err) => tracing::warn!(%err, "skipping malformed read-state row"),
            }
        }
        Ok(state)
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<(), AppError> {
        upsert_read_flag(&self.pool, &id.to_string()).await
    }

    async fn mark_all_read(&self, ids: &[NotificationId]) -> Result<(), AppError> {
        let mut keys = ids.iter().map(ToString::to_string).collect::<Vec<_>>();
        keys.push(MARK_ALL_READ_KEY.to_string());
        sqlx::query(
            "INSERT INTO notification_read_state (notification_id, read, updated_at) \
             SELECT key, TRUE, $2 FROM UNNEST($1::TEXT[]) AS key \
             ON CONFLICT (notification_id) DO UPDATE SET read = TRUE, updated_at = EXCLUDED.updated_at",
        )
        .bind(&keys)
        .bind(db_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

async fn upsert_read_flag(pool: &PgPool, key: &str) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO notification_read_state (notification_id, read, updated_at) VALUES ($1, TRUE, $2) \
         ON CONFLICT (notification_id) DO UPDATE SET read = TRUE, updated_at = EXCLUDED.updated_at",
    )
    .bind(key)
    .bind(db_now())
    .execute(pool)
    .await?;
    Ok(())
}
