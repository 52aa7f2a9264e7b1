use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::config::NotificationLimits;
use crate::error::AppError;
use crate::exchange::Engine;
use crate::notifications::Notifier;
use crate::store::Store;
use crate::types::*;

pub struct AppState {
    pub engine: Engine,
    pub notifier: Notifier,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, limits: NotificationLimits) -> Self {
        Self {
            engine: Engine::new(store.clone()),
            notifier: Notifier::new(store, limits),
        }
    }

    fn contacts(&self) -> &Arc<dyn Store> {
        self.engine.store()
    }
}

type ApiResult<T> = Result<T, AppError>;

/// JSON body whose rejections surface as `AppError::Validation`.
#[derive(FromRequest)]
#[from_request(via(Json), rejection(AppError))]
struct ApiJson<T>(T);

/// Query string whose rejections surface as `AppError::Validation`.
#[derive(FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
struct ApiQuery<T>(T);

/// A missing body is fine; a malformed one is not.
fn optional_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<Option<T>> {
    match body {
        Ok(Json(body)) => Ok(Some(body)),
        Err(JsonRejection::MissingJsonContentType(_)) => Ok(None),
        Err(rejection) => Err(rejection.into()),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chat/create", post(create_chat))
        .route("/api/chat/send", get(get_messages).post(post_message))
        .route("/api/chat/close", post(close_chat))
        .route("/api/chat/rating", get(get_ratings).post(post_rating))
        .route("/api/notifications", get(get_notifications))
        .route("/api/notifications/status", get(get_notification_status))
        .route("/api/notifications/mark-read", post(mark_notification_read))
        .route(
            "/api/notifications/mark-all-read",
            post(mark_all_notifications_read),
        )
        .route("/api/admin/chats", get(get_admin_chats))
        .route("/api/admin/chats/update", post(update_admin_chat))
        .route("/api/contact", get(get_contacts).post(create_contact))
        .route("/api/contact/update", post(update_contact))
        .route("/api/contact/reply", post(reply_contact))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": Utc::now() }))
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let (email, name) = optional_body(body)?
        .map(|b| (b.user_email, b.user_name))
        .unwrap_or_default();
    let created = state
        .engine
        .create_session(email.as_deref(), name.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_messages(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ChatIdQuery>,
) -> ApiResult<impl IntoResponse> {
    let messages = state.engine.list_messages(&query.chat_id).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<SendMessageBody>,
) -> ApiResult<impl IntoResponse> {
    let message = state
        .engine
        .append_message(&body.chat_id, &body.content, body.sender)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "message": message }))))
}

async fn close_chat(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CloseChatBody>,
) -> ApiResult<impl IntoResponse> {
    let chat = state.engine.close(&body.chat_id).await?;
    Ok(Json(json!({ "ok": true, "status": chat.status })))
}

async fn post_rating(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<RatingBody>,
) -> ApiResult<impl IntoResponse> {
    let rating = state
        .engine
        .submit_rating(
            &body.chat_id,
            body.rating,
            body.comment.as_deref(),
            body.user_email.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "rating": rating }))))
}

async fn get_ratings(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let (ratings, stats) = state.engine.ratings().await?;
    Ok(Json(json!({ "ratings": ratings, "stats": stats })))
}

async fn get_notifications(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.notifier.feed().await?))
}

async fn get_notification_status(
    State(state): State<Arc<AppState>>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.notifier.read_state().await?))
}

async fn mark_notification_read(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<MarkReadBody>,
) -> ApiResult<impl IntoResponse> {
    let id = state.notifier.mark_as_read(&body.notification_id).await?;
    Ok(Json(json!({ "ok": true, "notificationId": id })))
}

async fn mark_all_notifications_read(
    State(state): State<Arc<AppState>>,
    body: Result<Json<MarkAllReadBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let known = optional_body(body)?
        .map(|b| b.notification_ids)
        .unwrap_or_default();
    let marked = state.notifier.mark_all_as_read(&known).await?;
    Ok(Json(json!({ "ok": true, "marked": marked })))
}

async fn get_admin_chats(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ChatListQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty() && *s != "all")
        .map(str::parse::<ChatStatus>)
        .transpose()?;
    let chats = state.engine.list_chats(status, query.limit).await?;
    Ok(Json(json!({ "chats": chats })))
}

async fn update_admin_chat(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<UpdateChatBody>,
) -> ApiResult<impl IntoResponse> {
    let status = body.status.parse::<ChatStatus>()?;
    let chat = state.engine.update_status(&body.chat_id, status).await?;
    Ok(Json(json!({ "ok": true, "chat": chat })))
}

async fn get_contacts(
    State(state): State<Arc<AppState>>,
    ApiQuery(query): ApiQuery<ContactListQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty() && *s != "all")
        .map(str::parse::<ContactStatus>)
        .transpose()?;
    let contacts = state.contacts().list_contacts(status, query.limit).await?;
    Ok(Json(json!({ "contacts": contacts })))
}

async fn create_contact(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<CreateContactBody>,
) -> ApiResult<impl IntoResponse> {
    let required = [
        ("name", &body.name),
        ("email", &body.email),
        ("subject", &body.subject),
        ("message", &body.message),
    ];
    if let Some((field, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
        return Err(AppError::Validation(format!("{field} is required")));
    }
    let priority = body
        .priority
        .as_deref()
        .map(str::parse::<ContactPriority>)
        .transpose()?
        .unwrap_or(ContactPriority::Medium);

    let contact = state
        .contacts()
        .create_contact(NewContact {
            name: body.name.trim().to_string(),
            email: body.email.trim().to_string(),
            subject: body.subject.trim().to_string(),
            message: body.message.trim().to_string(),
            priority,
        })
        .await?;
    info!(contact_id = %contact.id, priority = priority.as_str(), "contact message filed");
    Ok((StatusCode::CREATED, Json(json!({ "contact": contact }))))
}

async fn update_contact(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<UpdateContactBody>,
) -> ApiResult<impl IntoResponse> {
    let status = body
        .status
        .as_deref()
        .map(str::parse::<ContactStatus>)
        .transpose()?;
    let priority = body
        .priority
        .as_deref()
        .map(str::parse::<ContactPriority>)
        .transpose()?;
    if status.is_none() && priority.is_none() {
        return Err(AppError::Validation("status or priority is required".into()));
    }
    let contact = state
        .contacts()
        .update_contact(&body.contact_id, status, priority)
        .await?
        .ok_or_else(|| AppError::ContactNotFound(body.contact_id.clone()))?;
    Ok(Json(json!({ "ok": true, "contact": contact })))
}

async fn reply_contact(
    State(state): State<Arc<AppState>>,
    ApiJson(body): ApiJson<ContactReplyBody>,
) -> ApiResult<impl IntoResponse> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err(AppError::Validation("message is required".into()));
    }
    let reply = ContactReply {
        id: Uuid::new_v4().to_string(),
        message: message.to_string(),
        author: body
            .author
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .unwrap_or("support")
            .to_string(),
        created_at: Utc::now(),
    };
    let contact = state
        .contacts()
        .add_contact_reply(&body.contact_id, reply)
        .await?
        .ok_or_else(|| AppError::ContactNotFound(body.contact_id.clone()))?;
    info!(contact_id = %contact.id, "contact message replied");
    Ok((StatusCode::CREATED, Json(json!({ "contact": contact }))))
}
