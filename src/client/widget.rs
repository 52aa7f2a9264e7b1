//! Visitor chat widget: binds to a chat, sends optimistically, polls for
//! replies, fires the one-shot bot auto-response and runs the closure and
//! rating flow.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::{ClientError, SupportApi};
use super::identity::{self, Binding, ClientSessionStore, Visitor};
use super::poller::Poller;
use super::{BOT_REPLY_DELAY, DISMISS_DELAY, VISITOR_POLL_INTERVAL};
use crate::bot;
use crate::types::{Message, MessageStatus, Rating, Sender};

#[derive(Debug, Clone, Copy)]
pub struct WidgetTiming {
    pub poll_interval: Duration,
    pub bot_delay: Duration,
    pub dismiss_delay: Duration,
}

impl Default for WidgetTiming {
    fn default() -> Self {
        Self {
            poll_interval: VISITOR_POLL_INTERVAL,
            bot_delay: BOT_REPLY_DELAY,
            dismiss_delay: DISMISS_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Detached,
    Open,
    AwaitingRating,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Confirmed,
    Failed,
}

/// One rendered message. Optimistic entries carry a local id until the
/// server acknowledges them.
#[derive(Debug, Clone)]
pub struct Entry {
    pub local_id: String,
    pub message: Message,
    pub delivery: Delivery,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Sent(Message),
    Ignored,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RatingOutcome {
    Submitted(Rating),
    NoStars,
    AlreadySubmitted,
    NotAwaitingRating,
    Failed(String),
}

const SEND_FAILED: &str = "Message not sent. Check your connection and try again.";
const CHAT_ENDED: &str = "This chat has ended. Start a new chat to keep talking to us.";
const RATING_FAILED: &str = "Could not submit your rating. Please try again.";

#[derive(Default)]
struct WidgetState {
    phase: Phase,
    chat_id: Option<String>,
    entries: Vec<Entry>,
    known_server_count: usize,
    history_known: bool,
    rating_in_flight: bool,
    dismissed: bool,
    notice: Option<String>,
}

impl WidgetState {
    fn has_confirmed(&self, message_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.delivery == Delivery::Confirmed && e.message.id == message_id)
    }

    fn push_confirmed(&mut self, message: Message) {
        if self.has_confirmed(&message.id) {
            return;
        }
        self.entries.push(Entry {
            local_id: message.id.clone(),
            message,
            delivery: Delivery::Confirmed,
        });
    }

    fn push_local(&mut self, message: Message, delivery: Delivery) -> String {
        let local_id = message.id.clone();
        self.entries.push(Entry {
            local_id: local_id.clone(),
            message,
            delivery,
        });
        local_id
    }

    fn confirm(&mut self, local_id: &str, message: Message) {
        if self.has_confirmed(&message.id) {
            // a poll already brought the server copy in
            self.entries.retain(|e| e.local_id != local_id);
            return;
        }
        match self.entries.iter_mut().find(|e| e.local_id == local_id) {
            Some(entry) => {
                entry.message = message;
                entry.delivery = Delivery::Confirmed;
            }
            None => self.push_confirmed(message),
        }
    }

    fn fail(&mut self, local_id: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.local_id == local_id) {
            entry.delivery = Delivery::Failed;
        }
    }

    /// Adopts the server's list once it has grown past the last known
    /// count. Unacknowledged local entries stay at the end.
    fn reconcile(&mut self, server: Vec<Message>) -> bool {
        self.history_known = true;
        if server.len() <= self.known_server_count {
            return false;
        }
        let unsent = self
            .entries
            .drain(..)
            .filter(|e| e.delivery != Delivery::Confirmed)
            .collect::<Vec<_>>();
        self.known_server_count = server.len();
        self.entries = server
            .into_iter()
            .map(|message| Entry {
                local_id: message.id.clone(),
                message,
                delivery: Delivery::Confirmed,
            })
            .collect();
        self.entries.extend(unsent);
        true
    }

    fn outstanding_user_messages(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.message.sender == Sender::User && e.delivery != Delivery::Failed)
            .count()
    }
}

fn local_message(chat_id: &str, content: &str, sender: Sender) -> Message {
    Message {
        id: format!("local-{}", Uuid::new_v4()),
        chat_id: chat_id.to_string(),
        content: content.to_string(),
        sender,
        timestamp: Utc::now(),
        status: MessageStatus::Sending,
    }
}

pub struct ChatWidget {
    api: Arc<dyn SupportApi>,
    memory: Arc<dyn ClientSessionStore>,
    visitor: Visitor,
    timing: WidgetTiming,
    state: Arc<Mutex<WidgetState>>,
    poller: Mutex<Option<Poller>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatWidget {
    pub fn new(
        api: Arc<dyn SupportApi>,
        memory: Arc<dyn ClientSessionStore>,
        visitor: Visitor,
        timing: WidgetTiming,
    ) -> Self {
        Self {
            api,
            memory,
            visitor,
            timing,
            state: Arc::new(Mutex::new(WidgetState::default())),
            poller: Mutex::new(None),
            timers: Mutex::new(Vec::new()),
        }
    }

    /// Attaches to the remembered chat or a fresh one and starts polling.
    pub async fn mount(&self) -> Result<(), ClientError> {
        let binding = identity::bind(self.api.as_ref(), self.memory.as_ref(), &self.visitor).await?;
        let chat_id = binding.chat_id().to_string();
        {
            let mut state = self.state.lock().await;
            *state = WidgetState {
                phase: Phase::Open,
                chat_id: Some(chat_id.clone()),
                history_known: true,
                ..WidgetState::default()
            };
            if let Binding::Reused { messages, .. } = binding {
                match messages {
                    Some(messages) => {
                        state.reconcile(messages);
                    }
                    None => state.history_known = false,
                }
            }
        }
        info!(chat_id = %chat_id, "chat widget mounted");
        self.start_polling().await;
        Ok(())
    }

    /// Stops polling and cancels pending bot replies and dismissal.
    pub async fn unmount(&self) {
        self.stop_polling().await;
        self.cancel_timers().await;
    }

    /// Forgets the current chat and binds to a brand new one.
    pub async fn start_new_chat(&self) -> Result<(), ClientError> {
        self.unmount().await;
        self.memory.forget();
        self.mount().await
    }

    pub async fn refresh(&self) -> bool {
        refresh_state(self.api.as_ref(), &self.state).await
    }

    pub async fn send(&self, text: &str) -> SendOutcome {
        let content = text.trim();
        if content.is_empty() {
            return SendOutcome::Ignored;
        }

        let (chat_id, local_id, prior, history_known) = {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Open {
                return SendOutcome::Ignored;
            }
            let Some(chat_id) = state.chat_id.clone() else {
                return SendOutcome::Ignored;
            };
            let prior = state.outstanding_user_messages();
            let local_id = state.push_local(
                local_message(&chat_id, content, Sender::User),
                Delivery::Pending,
            );
            state.notice = None;
            (chat_id, local_id, prior, state.history_known)
        };

        match self.api.send_message(&chat_id, content, Sender::User).await {
            Ok(message) => {
                let still_open = {
                    let mut state = self.state.lock().await;
                    state.confirm(&local_id, message.clone());
                    state.phase == Phase::Open && state.chat_id.as_deref() == Some(chat_id.as_str())
                };
                let first = still_open
                    && if history_known {
                        bot::should_auto_respond(prior)
                    } else {
                        self.opens_conversation(&chat_id, &message.id).await
                    };
                if first {
                    self.schedule_bot_reply(chat_id, content.to_string()).await;
                }
                SendOutcome::Sent(message)
            }
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "message send failed");
                let mut state = self.state.lock().await;
                state.fail(&local_id);
                state.notice = Some(
                    match &err {
                        ClientError::Status { status: 409, .. } => CHAT_ENDED,
                        _ => SEND_FAILED,
                    }
                    .to_string(),
                );
                SendOutcome::Failed(err.to_string())
            }
        }
    }

    /// Ends the chat with a farewell message and dismisses the widget.
    pub async fn close_without_rating(&self) -> bool {
        let chat_id = {
            let mut state = self.state.lock().await;
            if !matches!(state.phase, Phase::Open | Phase::AwaitingRating) {
                return false;
            }
            state.phase = Phase::Closed;
            state.chat_id.clone()
        };
        self.unmount().await;
        if let Some(chat_id) = chat_id {
            self.forget_chat(&chat_id);
            self.post_bot(&chat_id, bot::FAREWELL).await;
            self.close_remote(&chat_id).await;
        }
        self.schedule_dismiss().await;
        true
    }

    /// Ends the chat and asks the visitor for a 1-5 star rating.
    pub async fn close_with_rating(&self) -> bool {
        let chat_id = {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Open {
                return false;
            }
            state.phase = Phase::AwaitingRating;
            state.chat_id.clone()
        };
        self.unmount().await;
        if let Some(chat_id) = chat_id {
            self.forget_chat(&chat_id);
            self.post_bot(&chat_id, bot::RATING_PROMPT).await;
            self.close_remote(&chat_id).await;
        }
        true
    }

    /// Leaves the rating prompt without rating.
    pub async fn skip_rating(&self) -> bool {
        if self.phase().await != Phase::AwaitingRating {
            return false;
        }
        self.close_without_rating().await
    }

    pub async fn submit_rating(&self, stars: u8, comment: Option<&str>) -> RatingOutcome {
        let chat_id = {
            let mut state = self.state.lock().await;
            if state.phase != Phase::AwaitingRating {
                return RatingOutcome::NotAwaitingRating;
            }
            if stars == 0 {
                return RatingOutcome::NoStars;
            }
            let Some(chat_id) = state.chat_id.clone() else {
                return RatingOutcome::NotAwaitingRating;
            };
            if state.rating_in_flight || self.memory.rating_submitted(&chat_id) {
                return RatingOutcome::AlreadySubmitted;
            }
            state.rating_in_flight = true;
            chat_id
        };

        let comment = comment.map(str::trim).filter(|c| !c.is_empty());
        match self
            .api
            .submit_rating(&chat_id, stars, comment, self.visitor.email())
            .await
        {
            Ok(rating) => {
                self.memory.mark_rating_submitted(&chat_id);
                {
                    let mut state = self.state.lock().await;
                    state.rating_in_flight = false;
                    state.phase = Phase::Closed;
                    state.notice = None;
                }
                info!(chat_id = %chat_id, stars, "rating submitted");
                self.post_bot(&chat_id, bot::RATING_THANKS).await;
                self.schedule_dismiss().await;
                RatingOutcome::Submitted(rating)
            }
            Err(err) => {
                warn!(chat_id = %chat_id, error = %err, "rating submission failed");
                let mut state = self.state.lock().await;
                state.rating_in_flight = false;
                state.notice = Some(RATING_FAILED.to_string());
                RatingOutcome::Failed(err.to_string())
            }
        }
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    pub async fn chat_id(&self) -> Option<String> {
        self.state.lock().await.chat_id.clone()
    }

    pub async fn entries(&self) -> Vec<Entry> {
        self.state.lock().await.entries.clone()
    }

    pub async fn input_enabled(&self) -> bool {
        self.phase().await == Phase::Open
    }

    pub async fn is_dismissed(&self) -> bool {
        self.state.lock().await.dismissed
    }

    pub async fn notice(&self) -> Option<String> {
        self.state.lock().await.notice.clone()
    }

    async fn start_polling(&self) {
        let api = self.api.clone();
        let state = self.state.clone();
        let poller = Poller::spawn("visitor-chat", self.timing.poll_interval, move || {
            let api = api.clone();
            let state = state.clone();
            async move {
                refresh_state(api.as_ref(), &state).await;
            }
        });
        if let Some(previous) = self.poller.lock().await.replace(poller) {
            previous.stop();
        }
    }

    async fn cancel_timers(&self) {
        for timer in self.timers.lock().await.drain(..) {
            timer.abort();
        }
    }

    async fn stop_polling(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.stop();
        }
    }

    /// Sends a bot message; when that fails the text is still shown locally.
    async fn post_bot(&self, chat_id: &str, content: &str) {
        match self.api.send_message(chat_id, content, Sender::Bot).await {
            Ok(message) => self.state.lock().await.push_confirmed(message),
            Err(err) => {
                debug!(chat_id, error = %err, "bot message not stored");
                self.state
                    .lock()
                    .await
                    .push_local(local_message(chat_id, content, Sender::Bot), Delivery::Failed);
            }
        }
    }

    /// Asks the server whether `message_id` is the first user message of the
    /// chat. Unknown history never triggers the bot.
    async fn opens_conversation(&self, chat_id: &str, message_id: &str) -> bool {
        match self.api.list_messages(chat_id).await {
            Ok(messages) => {
                let first = messages
                    .iter()
                    .find(|m| m.sender == Sender::User)
                    .is_some_and(|m| m.id == message_id);
                let mut state = self.state.lock().await;
                if state.chat_id.as_deref() == Some(chat_id) {
                    state.reconcile(messages);
                }
                first
            }
            Err(err) => {
                warn!(chat_id, error = %err, "chat history unavailable, skipping bot reply");
                false
            }
        }
    }

    /// A closed chat is not offered again on the next mount.
    fn forget_chat(&self, chat_id: &str) {
        if self
            .memory
            .remembered()
            .is_some_and(|remembered| remembered.chat_id == chat_id)
        {
            self.memory.forget();
        }
    }

    async fn close_remote(&self, chat_id: &str) {
        if let Err(err) = self.api.close_chat(chat_id).await {
            warn!(chat_id, error = %err, "failed to close chat on server");
        }
    }

    async fn schedule_bot_reply(&self, chat_id: String, first_message: String) {
        let api = self.api.clone();
        let state = self.state.clone();
        let delay = self.timing.bot_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if state.lock().await.phase != Phase::Open {
                debug!(chat_id = %chat_id, "chat left open phase, dropping bot auto-response");
                return;
            }
            let reply = bot::auto_response(&first_message);
            match api.send_message(&chat_id, reply, Sender::Bot).await {
                Ok(message) => state.lock().await.push_confirmed(message),
                Err(err) => debug!(chat_id = %chat_id, error = %err, "bot auto-response not delivered"),
            }
        });
        self.timers.lock().await.push(handle);
    }

    async fn schedule_dismiss(&self) {
        let state = self.state.clone();
        let delay = self.timing.dismiss_delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.lock().await.dismissed = true;
        });
        self.timers.lock().await.push(handle);
    }
}

impl Drop for ChatWidget {
    fn drop(&mut self) {
        if let Ok(mut timers) = self.timers.try_lock() {
            for timer in timers.drain(..) {
                timer.abort();
            }
        }
    }
}

async fn refresh_state(api: &dyn SupportApi, state: &Mutex<WidgetState>) -> bool {
    let chat_id = {
        let state = state.lock().await;
        if state.phase != Phase::Open {
            return false;
        }
        match &state.chat_id {
            Some(chat_id) => chat_id.clone(),
            None => return false,
        }
    };

    match api.list_messages(&chat_id).await {
        Ok(messages) => {
            let mut state = state.lock().await;
            if state.chat_id.as_deref() != Some(chat_id.as_str()) {
                return false;
            }
            state.reconcile(messages)
        }
        Err(err) => {
            debug!(chat_id = %chat_id, error = %err, "message poll failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppState;
    use crate::client::api::LocalClient;
    use crate::client::identity::MemorySessionStore;
    use crate::config::NotificationLimits;
    use crate::store::MemoryStore;
    use crate::types::{ChatStatus, CreatedSession};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct ScriptedApi {
        inner: LocalClient,
        fail_sends: AtomicBool,
        fail_ratings: AtomicBool,
        failing_lists: AtomicUsize,
        user_send_delay: Duration,
        user_ack_delay: Duration,
    }

    fn unavailable() -> ClientError {
        ClientError::Status {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[async_trait]
    impl SupportApi for ScriptedApi {
        async fn create_session(
            &self,
            user_email: &str,
            user_name: &str,
        ) -> Result<CreatedSession, ClientError> {
            self.inner.create_session(user_email, user_name).await
        }

        async fn send_message(
            &self,
            chat_id: &str,
            content: &str,
            sender: Sender,
        ) -> Result<Message, ClientError> {
            if sender != Sender::User {
                return self.inner.send_message(chat_id, content, sender).await;
            }
            tokio::time::sleep(self.user_send_delay).await;
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            let stored = self.inner.send_message(chat_id, content, sender).await;
            tokio::time::sleep(self.user_ack_delay).await;
            stored
        }

        async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, ClientError> {
            let remaining = self.failing_lists.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_lists.store(remaining - 1, Ordering::SeqCst);
                return Err(unavailable());
            }
            self.inner.list_messages(chat_id).await
        }

        async fn close_chat(&self, chat_id: &str) -> Result<(), ClientError> {
            self.inner.close_chat(chat_id).await
        }

        async fn submit_rating(
            &self,
            chat_id: &str,
            rating: u8,
            comment: Option<&str>,
            user_email: &str,
        ) -> Result<Rating, ClientError> {
            if self.fail_ratings.load(Ordering::SeqCst) {
                return Err(unavailable());
            }
            self.inner
                .submit_rating(chat_id, rating, comment, user_email)
                .await
        }
    }

    struct Fixture {
        server: Arc<AppState>,
        api: Arc<ScriptedApi>,
        memory: Arc<MemorySessionStore>,
    }

    impl Fixture {
        fn new(user_send_delay: Duration) -> Self {
            Self::with_delays(user_send_delay, Duration::ZERO)
        }

        fn with_delays(user_send_delay: Duration, user_ack_delay: Duration) -> Self {
            let server = Arc::new(AppState::new(
                Arc::new(MemoryStore::new()),
                NotificationLimits::default(),
            ));
            let api = Arc::new(ScriptedApi {
                inner: LocalClient::new(server.clone()),
                fail_sends: AtomicBool::new(false),
                fail_ratings: AtomicBool::new(false),
                failing_lists: AtomicUsize::new(0),
                user_send_delay,
                user_ack_delay,
            });
            Self {
                server,
                api,
                memory: Arc::new(MemorySessionStore::new()),
            }
        }

        async fn widget(&self, visitor: Visitor) -> Arc<ChatWidget> {
            let widget = Arc::new(ChatWidget::new(
                self.api.clone(),
                self.memory.clone(),
                visitor,
                WidgetTiming::default(),
            ));
            widget.mount().await.unwrap();
            widget
        }

        async fn server_messages(&self, chat_id: &str) -> Vec<Message> {
            self.server.engine.list_messages(chat_id).await.unwrap()
        }

        async fn server_status(&self, chat_id: &str) -> ChatStatus {
            self.server
                .engine
                .list_chats(None, None)
                .await
                .unwrap()
                .into_iter()
                .find(|c| c.id == chat_id)
                .map(|c| c.status)
                .unwrap()
        }
    }

    fn bot_count(messages: &[Message]) -> usize {
        messages.iter().filter(|m| m.sender == Sender::Bot).count()
    }

    #[tokio::test(start_paused = true)]
    async fn message_appears_before_the_server_acknowledges_it() {
        let fx = Fixture::new(Duration::from_millis(500));
        let widget = fx.widget(Visitor::guest()).await;

        let sending = {
            let widget = widget.clone();
            tokio::spawn(async move { widget.send("  hello there ").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let entries = widget.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].delivery, Delivery::Pending);
        assert_eq!(entries[0].message.content, "hello there");

        let outcome = sending.await.unwrap();
        let SendOutcome::Sent(message) = outcome else {
            panic!("expected the send to succeed");
        };
        let entries = widget.entries().await;
        assert_eq!(entries[0].delivery, Delivery::Confirmed);
        assert_eq!(entries[0].message.id, message.id);
        assert_eq!(entries[0].message.status, MessageStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_is_flagged_and_input_stays_enabled() {
        let fx = Fixture::new(Duration::ZERO);
        fx.api.fail_sends.store(true, Ordering::SeqCst);
        let widget = fx.widget(Visitor::guest()).await;

        let outcome = widget.send("hello").await;
        assert!(matches!(outcome, SendOutcome::Failed(_)));
        let entries = widget.entries().await;
        assert_eq!(entries[0].delivery, Delivery::Failed);
        assert!(widget.input_enabled().await);
        assert_eq!(widget.notice().await.as_deref(), Some(SEND_FAILED));
        assert_eq!(widget.send("   ").await, SendOutcome::Ignored);

        // nothing was stored, so the first successful send still gets the bot
        fx.api.fail_sends.store(false, Ordering::SeqCst);
        assert!(matches!(widget.send("hello again").await, SendOutcome::Sent(_)));
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let chat_id = widget.chat_id().await.unwrap();
        assert_eq!(bot_count(&fx.server_messages(&chat_id).await), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn only_the_first_message_gets_a_bot_reply() {
        let fx = Fixture::new(Duration::ZERO);
        let widget = fx.widget(Visitor::guest()).await;
        let chat_id = widget.chat_id().await.unwrap();

        widget.send("عندي مشكلة في الدفع").await;
        assert_eq!(bot_count(&fx.server_messages(&chat_id).await), 0);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let messages = fx.server_messages(&chat_id).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].sender, Sender::Bot);
        assert_eq!(messages[1].content, bot::ReplyCategory::Problem.reply());
        assert_eq!(fx.server_status(&chat_id).await, ChatStatus::Waiting);

        widget.send("any update?").await;
        tokio::time::sleep(Duration::from_secs(4)).await;
        let messages = fx.server_messages(&chat_id).await;
        assert_eq!(messages.len(), 3);
        assert_eq!(bot_count(&messages), 1);

        let entries = widget.entries().await;
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().all(|e| e.delivery == Delivery::Confirmed));
    }

    #[tokio::test(start_paused = true)]
    async fn reload_reuses_the_chat_without_a_second_bot_reply() {
        let fx = Fixture::new(Duration::ZERO);
        let visitor = Visitor::known("maha@example.com", "Maha");
        let first = fx.widget(visitor.clone()).await;
        first.send("مرحبا").await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let chat_id = first.chat_id().await.unwrap();
        first.unmount().await;
        drop(first);

        let reloaded = fx.widget(visitor).await;
        assert_eq!(reloaded.chat_id().await.as_deref(), Some(chat_id.as_str()));
        assert_eq!(reloaded.entries().await.len(), 2);

        reloaded.send("still there?").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        let messages = fx.server_messages(&chat_id).await;
        assert_eq!(messages.len(), 3);
        assert_eq!(bot_count(&messages), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_with_unreadable_history_asks_the_server_before_replying() {
        let fx = Fixture::new(Duration::ZERO);
        let visitor = Visitor::known("maha@example.com", "Maha");
        let first = fx.widget(visitor.clone()).await;
        first.send("مرحبا").await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        let chat_id = first.chat_id().await.unwrap();
        first.unmount().await;
        drop(first);

        fx.api.failing_lists.store(1, Ordering::SeqCst);
        let reloaded = fx.widget(visitor).await;
        assert_eq!(reloaded.chat_id().await.as_deref(), Some(chat_id.as_str()));
        assert!(reloaded.entries().await.is_empty());

        assert!(matches!(reloaded.send("any news?").await, SendOutcome::Sent(_)));
        tokio::time::sleep(Duration::from_secs(2)).await;
        let senders = fx
            .server_messages(&chat_id)
            .await
            .iter()
            .map(|m| m.sender)
            .collect::<Vec<_>>();
        assert_eq!(senders, vec![Sender::User, Sender::Bot, Sender::User]);
        assert_eq!(reloaded.entries().await.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_history_without_a_server_answer_skips_the_bot() {
        let fx = Fixture::new(Duration::ZERO);
        let visitor = Visitor::known("nour@example.com", "Nour");
        let first = fx.widget(visitor.clone()).await;
        let chat_id = first.chat_id().await.unwrap();
        first.unmount().await;
        drop(first);

        fx.api.failing_lists.store(2, Ordering::SeqCst);
        let reloaded = fx.widget(visitor).await;
        reloaded.send("hello").await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(bot_count(&fx.server_messages(&chat_id).await), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_picks_up_support_replies() {
        let fx = Fixture::new(Duration::ZERO);
        let widget = fx.widget(Visitor::guest()).await;
        let chat_id = widget.chat_id().await.unwrap();
        widget.send("هل يمكنني الدفع بالبطاقة؟").await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;

        fx.server
            .engine
            .append_message(&chat_id, "نعم، نقبل البطاقات", Sender::Support)
            .await
            .unwrap();
        assert_eq!(fx.server_status(&chat_id).await, ChatStatus::Active);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let entries = widget.entries().await;
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].message.sender, Sender::Support);
        assert!(!widget.refresh().await);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_without_rating_says_goodbye_then_dismisses() {
        let fx = Fixture::new(Duration::ZERO);
        let widget = fx.widget(Visitor::guest()).await;
        let chat_id = widget.chat_id().await.unwrap();

        assert!(widget.close_without_rating().await);
        assert!(!widget.input_enabled().await);
        assert_eq!(widget.send("wait").await, SendOutcome::Ignored);
        assert_eq!(fx.server_status(&chat_id).await, ChatStatus::Closed);

        let messages = fx.server_messages(&chat_id).await;
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some(bot::FAREWELL));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!widget.is_dismissed().await);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(widget.is_dismissed().await);
        assert!(!widget.close_without_rating().await);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_chat_is_not_reopened_on_reload() {
        let fx = Fixture::new(Duration::ZERO);
        let widget = fx.widget(Visitor::guest()).await;
        let closed = widget.chat_id().await.unwrap();
        widget.send("hello").await;
        widget.close_without_rating().await;
        assert!(fx.memory.remembered().is_none());
        drop(widget);

        let reloaded = fx.widget(Visitor::guest()).await;
        let fresh = reloaded.chat_id().await.unwrap();
        assert_ne!(fresh, closed);
        assert_eq!(reloaded.phase().await, Phase::Open);
        assert!(reloaded.entries().await.is_empty());
        assert!(matches!(reloaded.send("again").await, SendOutcome::Sent(_)));
        assert_eq!(fx.server_status(&closed).await, ChatStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn late_acknowledgement_after_closing_does_not_wake_the_bot() {
        let fx = Fixture::with_delays(Duration::ZERO, Duration::from_millis(500));
        let widget = fx.widget(Visitor::guest()).await;
        let chat_id = widget.chat_id().await.unwrap();

        let sending = {
            let widget = widget.clone();
            tokio::spawn(async move { widget.send("عندي مشكلة").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(widget.close_without_rating().await);
        assert!(matches!(sending.await.unwrap(), SendOutcome::Sent(_)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let messages = fx.server_messages(&chat_id).await;
        let log = messages
            .iter()
            .map(|m| (m.sender, m.content.as_str()))
            .collect::<Vec<_>>();
        assert_eq!(
            log,
            vec![(Sender::User, "عندي مشكلة"), (Sender::Bot, bot::FAREWELL)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rating_flow_records_one_rating_per_chat() {
        let fx = Fixture::new(Duration::ZERO);
        let visitor = Visitor::known("yousef@example.com", "Yousef");
        let widget = fx.widget(visitor.clone()).await;
        let chat_id = widget.chat_id().await.unwrap();
        widget.send("thanks for the help").await;

        assert_eq!(
            widget.submit_rating(5, None).await,
            RatingOutcome::NotAwaitingRating
        );
        assert!(widget.close_with_rating().await);
        assert_eq!(widget.phase().await, Phase::AwaitingRating);
        assert_eq!(fx.server_status(&chat_id).await, ChatStatus::Closed);
        assert_eq!(widget.submit_rating(0, None).await, RatingOutcome::NoStars);

        let outcome = widget.submit_rating(4, Some(" جيد ")).await;
        let RatingOutcome::Submitted(rating) = outcome else {
            panic!("expected the rating to be stored, got {outcome:?}");
        };
        assert_eq!(rating.comment.as_deref(), Some("جيد"));
        assert_eq!(rating.user_email, "yousef@example.com");
        assert!(fx.memory.rating_submitted(&chat_id));
        assert_eq!(
            widget.submit_rating(4, None).await,
            RatingOutcome::NotAwaitingRating
        );

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(widget.is_dismissed().await);
        let messages = fx.server_messages(&chat_id).await;
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some(bot::RATING_THANKS));

        // a reload lands in a new chat; the rated one stays rated
        let reloaded = fx.widget(visitor).await;
        assert_ne!(reloaded.chat_id().await.as_deref(), Some(chat_id.as_str()));
        assert!(fx.memory.rating_submitted(&chat_id));
        assert_eq!(
            fx.server_messages(&chat_id)
                .await
                .iter()
                .filter(|m| m.content == bot::RATING_PROMPT)
                .count(),
            1
        );

        let (ratings, stats) = fx.server.engine.ratings().await.unwrap();
        assert_eq!(ratings.len(), 1);
        assert_eq!(stats.average, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rating_keeps_the_prompt_open() {
        let fx = Fixture::new(Duration::ZERO);
        fx.api.fail_ratings.store(true, Ordering::SeqCst);
        let widget = fx.widget(Visitor::guest()).await;
        let chat_id = widget.chat_id().await.unwrap();
        widget.close_with_rating().await;

        assert!(matches!(
            widget.submit_rating(4, None).await,
            RatingOutcome::Failed(_)
        ));
        assert_eq!(widget.phase().await, Phase::AwaitingRating);
        assert_eq!(widget.notice().await.as_deref(), Some(RATING_FAILED));
        assert!(!fx.memory.rating_submitted(&chat_id));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!widget.is_dismissed().await);

        fx.api.fail_ratings.store(false, Ordering::SeqCst);
        assert!(matches!(
            widget.submit_rating(4, None).await,
            RatingOutcome::Submitted(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn skipping_the_rating_closes_with_a_farewell() {
        let fx = Fixture::new(Duration::ZERO);
        let widget = fx.widget(Visitor::guest()).await;
        let chat_id = widget.chat_id().await.unwrap();

        assert!(!widget.skip_rating().await);
        widget.close_with_rating().await;
        assert!(widget.skip_rating().await);
        assert_eq!(widget.phase().await, Phase::Closed);

        let messages = fx.server_messages(&chat_id).await;
        let texts = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
        assert_eq!(texts, vec![bot::RATING_PROMPT, bot::FAREWELL]);
        assert!(fx.server.engine.ratings().await.unwrap().0.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_chat_after_closing_starts_over() {
        let fx = Fixture::new(Duration::ZERO);
        let visitor = Visitor::known("rana@example.com", "Rana");
        let widget = fx.widget(visitor).await;
        let old_chat = widget.chat_id().await.unwrap();
        widget.send("first question").await;
        widget.close_without_rating().await;

        widget.start_new_chat().await.unwrap();
        let new_chat = widget.chat_id().await.unwrap();
        assert_ne!(old_chat, new_chat);
        assert_eq!(widget.phase().await, Phase::Open);
        assert!(widget.entries().await.is_empty());
        assert!(!widget.is_dismissed().await);

        widget.send("second question").await;
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(bot_count(&fx.server_messages(&new_chat).await), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sending_into_a_chat_closed_elsewhere_explains_why() {
        let fx = Fixture::new(Duration::ZERO);
        let widget = fx.widget(Visitor::guest()).await;
        let chat_id = widget.chat_id().await.unwrap();
        fx.server.engine.close(&chat_id).await.unwrap();

        assert!(matches!(widget.send("hello?").await, SendOutcome::Failed(_)));
        assert_eq!(widget.notice().await.as_deref(), Some(CHAT_ENDED));
    }
}
