//! Visitor identity and the client-side memory of the current chat, used to
//! reattach to a session across reloads instead of creating a new one.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::api::{ClientError, SupportApi};
use crate::types::{Message, SessionOrigin, GUEST_EMAIL, GUEST_NAME};

/// Who is chatting. Anonymous visitors resolve to the guest identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Visitor {
    pub email: Option<String>,
    pub name: Option<String>,
}

impl Visitor {
    pub fn guest() -> Self {
        Self::default()
    }

    pub fn known(email: &str, name: &str) -> Self {
        Self {
            email: Some(email.to_string()),
            name: Some(name.to_string()),
        }
    }

    pub fn email(&self) -> &str {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .unwrap_or(GUEST_EMAIL)
    }

    pub fn name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(GUEST_NAME)
    }
}

/// Remembered chat id and the identity it was created for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RememberedChat {
    pub chat_id: String,
    pub user_email: String,
}

/// Client-side key/value memory. Writes are best effort.
pub trait ClientSessionStore: Send + Sync {
    fn remembered(&self) -> Option<RememberedChat>;
    fn remember(&self, chat: &RememberedChat);
    fn forget(&self);
    fn rating_submitted(&self, chat_id: &str) -> bool;
    fn mark_rating_submitted(&self, chat_id: &str);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Persisted {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    livechat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    livechat_user: Option<String>,
    #[serde(default)]
    rated: BTreeSet<String>,
}

impl Persisted {
    fn chat(&self) -> Option<RememberedChat> {
        Some(RememberedChat {
            chat_id: self.livechat_id.clone()?,
            user_email: self.livechat_user.clone()?,
        })
    }

    fn set_chat(&mut self, chat: Option<&RememberedChat>) {
        self.livechat_id = chat.map(|c| c.chat_id.clone());
        self.livechat_user = chat.map(|c| c.user_email.clone());
    }
}

fn lock(inner: &Mutex<Persisted>) -> MutexGuard<'_, Persisted> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
pub struct MemorySessionStore {
    inner: Mutex<Persisted>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientSessionStore for MemorySessionStore {
    fn remembered(&self) -> Option<RememberedChat> {
        lock(&self.inner).chat()
    }

    fn remember(&self, chat: &RememberedChat) {
        lock(&self.inner).set_chat(Some(chat));
    }

    fn forget(&self) {
        lock(&self.inner).set_chat(None);
    }

    fn rating_submitted(&self, chat_id: &str) -> bool {
        lock(&self.inner).rated.contains(chat_id)
    }

    fn mark_rating_submitted(&self, chat_id: &str) {
        lock(&self.inner).rated.insert(chat_id.to_string());
    }
}

/// JSON file that survives restarts of the embedding process.
pub struct FileSessionStore {
    path: PathBuf,
    inner: Mutex<Persisted>,
}

impl FileSessionStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let persisted = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable session file");
                Persisted::default()
            }),
            Err(_) => Persisted::default(),
        };
        Self {
            path,
            inner: Mutex::new(persisted),
        }
    }

    fn update(&self, f: impl FnOnce(&mut Persisted)) {
        let mut guard = lock(&self.inner);
        f(&mut guard);
        let written = serde_json::to_string_pretty(&*guard)
            .map_err(|err| err.to_string())
            .and_then(|raw| std::fs::write(&self.path, raw).map_err(|err| err.to_string()));
        if let Err(err) = written {
            warn!(path = %self.path.display(), error = %err, "failed to persist session file");
        }
    }
}

impl ClientSessionStore for FileSessionStore {
    fn remembered(&self) -> Option<RememberedChat> {
        lock(&self.inner).chat()
    }

    fn remember(&self, chat: &RememberedChat) {
        self.update(|p| p.set_chat(Some(chat)));
    }

    fn forget(&self) {
        self.update(|p| p.set_chat(None));
    }

    fn rating_submitted(&self, chat_id: &str) -> bool {
        lock(&self.inner).rated.contains(chat_id)
    }

    fn mark_rating_submitted(&self, chat_id: &str) {
        self.update(|p| {
            p.rated.insert(chat_id.to_string());
        });
    }
}

/// Outcome of attaching the widget to a chat.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// The remembered chat was reused. `messages` is its current history,
    /// or `None` when the history could not be loaded.
    Reused {
        chat_id: String,
        messages: Option<Vec<Message>>,
    },
    /// A fresh session was created and remembered.
    Fresh {
        chat_id: String,
        origin: SessionOrigin,
    },
}

impl Binding {
    pub fn chat_id(&self) -> &str {
        match self {
            Binding::Reused { chat_id, .. } | Binding::Fresh { chat_id, .. } => chat_id,
        }
    }
}

/// Reuses the remembered chat when it belongs to `visitor`; otherwise, or
/// when the server no longer knows it, creates a session and remembers it.
/// A transient failure while loading a remembered chat keeps it.
pub async fn bind(
    api: &dyn SupportApi,
    store: &dyn ClientSessionStore,
    visitor: &Visitor,
) -> Result<Binding, ClientError> {
    if let Some(remembered) = store.remembered() {
        if remembered.user_email == visitor.email() {
            match api.list_messages(&remembered.chat_id).await {
                Ok(messages) => {
                    debug!(chat_id = %remembered.chat_id, "reusing remembered chat");
                    return Ok(Binding::Reused {
                        chat_id: remembered.chat_id,
                        messages: Some(messages),
                    });
                }
                Err(err) if err.is_not_found() => {
                    info!(chat_id = %remembered.chat_id, "remembered chat is gone, starting a new one");
                    store.forget();
                }
                Err(err) => {
                    warn!(chat_id = %remembered.chat_id, error = %err, "could not load remembered chat");
                    return Ok(Binding::Reused {
                        chat_id: remembered.chat_id,
                        messages: None,
                    });
                }
            }
        }
    }

    let created = api.create_session(visitor.email(), visitor.name()).await?;
    store.remember(&RememberedChat {
        chat_id: created.chat_id.clone(),
        user_email: visitor.email().to_string(),
    });
    Ok(Binding::Fresh {
        chat_id: created.chat_id,
        origin: created.status,
    })
}
