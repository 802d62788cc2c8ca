use crate::api::client::ChatApi;
use crate::api::models::{Message, OutgoingMessage, User};
use crate::api::socket::Realtime;
use crate::error::ChatError;
use crate::storage::UserCache;
use crate::store::{Action, ChatState, Effect};
use crate::ui::notify::{Chime, Notification, Notifier, SoundError};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Reports a request task's outcome. If the task unwinds before reporting,
/// `RequestAbandoned` is sent instead so the in-flight count still drops.
struct Completion {
    tx: Option<mpsc::UnboundedSender<Action>>,
}

impl Completion {
    fn finish(mut self, action: Action) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(action);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Action::RequestAbandoned);
        }
    }
}

/// Runs the store: applies actions, carries out the effects they produce and
/// feeds request completions and realtime deliveries back in through one queue.
pub struct ChatSession {
    state: ChatState,
    api: Arc<dyn ChatApi>,
    realtime: Realtime,
    notifier: Arc<dyn Notifier>,
    chime: Arc<dyn Chime>,
    cache: Option<UserCache>,
    tx: mpsc::UnboundedSender<Action>,
    rx: mpsc::UnboundedReceiver<Action>,
    in_flight: usize,
}

impl ChatSession {
    pub fn new(api: Arc<dyn ChatApi>, realtime: Realtime, notifier: Arc<dyn Notifier>, chime: Arc<dyn Chime>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            state: ChatState::new(),
            api,
            realtime,
            notifier,
            chime,
            cache: None,
            tx,
            rx,
            in_flight: 0,
        }
    }

    pub fn with_cache(mut self, cache: UserCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn state(&self) -> &ChatState {
        &self.state
    }

    pub fn realtime(&self) -> &Realtime {
        &self.realtime
    }

    pub fn load_users(&mut self) -> Result<(), ChatError> {
        self.dispatch(Action::LoadUsers)
    }

    pub fn load_messages(&mut self, user_id: &str) -> Result<(), ChatError> {
        self.dispatch(Action::LoadMessages(user_id.to_string()))
    }

    pub fn send_message(&mut self, payload: OutgoingMessage) -> Result<(), ChatError> {
        self.dispatch(Action::SendMessage(payload))
    }

    pub fn mark_as_read(&mut self, user_id: &str) -> Result<(), ChatError> {
        self.dispatch(Action::MarkAsRead(user_id.to_string()))
    }

    /// Shows a toast outside the action flow, e.g. for input the front end rejects.
    pub fn notify(&self, notification: Notification) {
        self.notifier.notify(&notification);
    }

    pub fn has_unread(&self, user_id: &str) -> bool {
        self.state.has_unread(user_id)
    }

    pub fn subscribe_to_incoming(&mut self) -> Result<(), ChatError> {
        self.dispatch(Action::Subscribe)
    }

    pub fn unsubscribe_from_incoming(&mut self) -> Result<(), ChatError> {
        self.dispatch(Action::Unsubscribe)
    }

    pub fn set_selected_user(&mut self, user: Option<User>) -> Result<(), ChatError> {
        self.dispatch(Action::SelectUser(user))
    }

    /// Seeds the roster from the local cache if nothing has been fetched yet.
    pub fn restore_cached_users(&mut self, limit: usize) -> Result<(), ChatError> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let users = match cache.cached_users(limit) {
            Ok(users) => users,
            Err(e) => {
                log::warn!("reading cached users failed: {e}");
                return Ok(());
            }
        };
        if users.is_empty() {
            return Ok(());
        }
        self.dispatch(Action::UsersRestored(users))
    }

    pub fn dispatch(&mut self, action: Action) -> Result<(), ChatError> {
        let effects = self.state.apply(action)?;
        for effect in effects {
            self.run(effect);
        }
        Ok(())
    }

    /// Waits for the next queued action and applies it. Returns `false` once
    /// the queue can no longer produce anything.
    pub async fn next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(action) => {
                self.complete(action);
                true
            }
            None => false,
        }
    }

    /// Applies queued actions until no request is outstanding and the queue is empty.
    pub async fn settle(&mut self) {
        loop {
            while let Ok(action) = self.rx.try_recv() {
                self.complete(action);
            }
            if self.in_flight == 0 {
                break;
            }
            if !self.next().await {
                break;
            }
        }
    }

    fn complete(&mut self, action: Action) {
        if matches!(
            action,
            Action::UsersLoaded(_)
                | Action::MessagesLoaded { .. }
                | Action::MessageSent { .. }
                | Action::MarkedRead { .. }
                | Action::RequestAbandoned
        ) {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        // Completions never carry a SendMessage, the only action that can fail.
        if let Err(e) = self.dispatch(action) {
            log::error!("queued action failed: {e}");
        }
    }

    fn spawn<F>(&mut self, fut: F)
    where
        F: std::future::Future<Output = Action> + Send + 'static,
    {
        self.in_flight += 1;
        let completion = Completion { tx: Some(self.tx.clone()) };
        tokio::spawn(async move {
            completion.finish(fut.await);
        });
    }

    fn run(&mut self, effect: Effect) {
        match effect {
            Effect::FetchUsers => {
                let api = self.api.clone();
                self.spawn(async move { Action::UsersLoaded(api.users().await) });
            }
            Effect::FetchMessages { request, user_id } => {
                let api = self.api.clone();
                self.spawn(async move {
                    let result = api.messages(&user_id).await;
                    Action::MessagesLoaded { request, user_id, result }
                });
            }
            Effect::Send { recipient_id, payload } => {
                let api = self.api.clone();
                self.spawn(async move {
                    let result = api.send(&recipient_id, &payload).await;
                    Action::MessageSent { recipient_id, result }
                });
            }
            Effect::MarkRead { user_id } => {
                let api = self.api.clone();
                self.spawn(async move {
                    let result = api.mark_read(&user_id).await;
                    Action::MarkedRead { user_id, result }
                });
            }
            Effect::CacheUsers(users) => {
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.upsert_users(&users) {
                        log::warn!("caching users failed: {e}");
                    }
                }
            }
            Effect::Subscribe(event) => {
                let tx = self.tx.clone();
                self.realtime.on(event, move |payload| match serde_json::from_value::<Message>(payload) {
                    Ok(msg) => {
                        let _ = tx.send(Action::Incoming(msg));
                    }
                    Err(e) => log::warn!("ignoring malformed {event} payload: {e}"),
                });
            }
            Effect::Unsubscribe(event) => {
                self.realtime.off(event);
            }
            Effect::Notify(notification) => self.notifier.notify(&notification),
            Effect::PlaySound { volume } => {
                match self.chime.play(volume) {
                    Ok(()) => {}
                    Err(SoundError::Muted) => log::debug!("notification sound muted"),
                    Err(e) => log::warn!("Notification sound blocked: {e}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::error::ApiError;
    use crate::api::events::NEW_MESSAGE;
    use crate::ui::notify::Level;
    use async_trait::async_trait;
    use reqwest::StatusCode;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeApi {
        users: Mutex<Option<Result<Value, u16>>>,
        histories: Mutex<HashMap<String, Vec<Message>>>,
        sent: Mutex<Vec<(String, OutgoingMessage)>>,
        fail_mark_read: bool,
        panic_on_users: bool,
    }

    fn api_err(status: u16) -> ApiError {
        ApiError::from_body(StatusCode::from_u16(status).unwrap(), "")
    }

    #[async_trait]
    impl ChatApi for FakeApi {
        async fn users(&self) -> Result<Vec<User>, ApiError> {
            if self.panic_on_users {
                panic!("roster backend crashed");
            }
            match self.users.lock().unwrap().clone() {
                Some(Ok(Value::Array(items))) => Ok(items.into_iter().filter_map(|v| serde_json::from_value(v).ok()).collect()),
                Some(Ok(_)) | None => Ok(Vec::new()),
                Some(Err(status)) => Err(api_err(status)),
            }
        }

        async fn messages(&self, user_id: &str) -> Result<Vec<Message>, ApiError> {
            Ok(self.histories.lock().unwrap().get(user_id).cloned().unwrap_or_default())
        }

        async fn send(&self, user_id: &str, payload: &OutgoingMessage) -> Result<Message, ApiError> {
            self.sent.lock().unwrap().push((user_id.to_string(), payload.clone()));
            Ok(message("sent-1", "me", user_id))
        }

        async fn mark_read(&self, _user_id: &str) -> Result<(), ApiError> {
            if self.fail_mark_read { Err(api_err(500)) } else { Ok(()) }
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Notification>>);

    impl Notifier for Recorder {
        fn notify(&self, n: &Notification) {
            self.0.lock().unwrap().push(n.clone());
        }
    }

    struct BrokenSpeaker(AtomicUsize);

    impl Chime for BrokenSpeaker {
        fn play(&self, _volume: f32) -> Result<(), SoundError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(SoundError::Muted)
        }
    }

    fn message(id: &str, from: &str, to: &str) -> Message {
        serde_json::from_value(json!({
            "_id": id,
            "senderId": from,
            "receiverId": to,
            "text": "hey",
            "createdAt": "2024-05-01T10:00:00Z"
        }))
        .unwrap()
    }

    fn user(id: &str, name: &str) -> User {
        User { id: id.into(), full_name: name.into(), email: None, profile_pic: None }
    }

    struct Harness {
        session: ChatSession,
        api: Arc<FakeApi>,
        notes: Arc<Recorder>,
        chime: Arc<BrokenSpeaker>,
    }

    fn harness(api: FakeApi) -> Harness {
        let api = Arc::new(api);
        let notes = Arc::new(Recorder::default());
        let chime = Arc::new(BrokenSpeaker(AtomicUsize::new(0)));
        let session = ChatSession::new(api.clone(), Realtime::new(), notes.clone(), chime.clone());
        Harness { session, api, notes, chime }
    }

    #[tokio::test]
    async fn load_users_replaces_roster() {
        let api = FakeApi::default();
        *api.users.lock().unwrap() = Some(Ok(json!([{ "_id": "u1", "fullName": "Ada" }])));
        let mut h = harness(api);

        h.session.load_users().unwrap();
        assert!(h.session.state().users_loading());
        h.session.settle().await;

        assert!(!h.session.state().users_loading());
        assert_eq!(h.session.state().users(), &[user("u1", "Ada")]);
        assert!(h.notes.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_user_list_is_empty() {
        let api = FakeApi::default();
        *api.users.lock().unwrap() = Some(Ok(json!({ "oops": true })));
        let mut h = harness(api);

        h.session.load_users().unwrap();
        h.session.settle().await;
        assert!(h.session.state().users().is_empty());
        assert!(!h.session.state().users_loading());
    }

    #[tokio::test]
    async fn rejected_user_fetch_notifies() {
        let api = FakeApi::default();
        *api.users.lock().unwrap() = Some(Err(503));
        let mut h = harness(api);

        h.session.load_users().unwrap();
        h.session.settle().await;

        assert!(!h.session.state().users_loading());
        let notes = h.notes.0.lock().unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].level, Level::Error);
        assert_eq!(notes[0].text, "Error fetching users");
    }

    #[tokio::test]
    async fn double_subscribe_delivers_once() {
        let mut h = harness(FakeApi::default());
        h.session.set_selected_user(Some(user("u1", "Ada"))).unwrap();
        h.session.subscribe_to_incoming().unwrap();
        h.session.subscribe_to_incoming().unwrap();

        let payload = serde_json::to_value(message("m1", "u1", "me")).unwrap();
        assert!(h.session.realtime().deliver(NEW_MESSAGE, payload));

        let mut queued = 0;
        while let Ok(action) = h.session.rx.try_recv() {
            assert!(matches!(action, Action::Incoming(_)));
            queued += 1;
            h.session.complete(action);
        }
        assert_eq!(queued, 1);
        assert_eq!(h.session.state().messages().len(), 1);
    }

    #[tokio::test]
    async fn panicked_request_does_not_stall_settle() {
        let api = FakeApi { panic_on_users: true, ..FakeApi::default() };
        let mut h = harness(api);

        h.session.load_users().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), h.session.settle())
            .await
            .expect("settle returned after the request task panicked");
        assert_eq!(h.session.in_flight, 0);
    }

    #[tokio::test]
    async fn incoming_from_other_user_rings_and_swallows_sound_error() {
        let mut h = harness(FakeApi::default());
        h.session.set_selected_user(Some(user("u1", "Ada"))).unwrap();
        h.session.subscribe_to_incoming().unwrap();

        let mut other = message("m2", "u2", "me");
        other.sender_name = Some("Grace".into());
        h.session.realtime().deliver(NEW_MESSAGE, serde_json::to_value(other).unwrap());
        h.session.settle().await;

        assert!(h.session.state().messages().is_empty());
        assert_eq!(h.notes.0.lock().unwrap()[0].text, "New message from Grace");
        assert_eq!(h.chime.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_handler() {
        let mut h = harness(FakeApi::default());
        h.session.subscribe_to_incoming().unwrap();
        assert!(h.session.realtime().is_subscribed(NEW_MESSAGE));
        h.session.unsubscribe_from_incoming().unwrap();
        assert!(!h.session.realtime().deliver(NEW_MESSAGE, json!({})));
    }

    #[tokio::test]
    async fn malformed_realtime_payload_is_ignored() {
        let mut h = harness(FakeApi::default());
        h.session.subscribe_to_incoming().unwrap();
        h.session.realtime().deliver(NEW_MESSAGE, json!({ "senderId": 7 }));
        h.session.settle().await;
        assert!(h.session.state().messages().is_empty());
        assert!(h.notes.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_without_selection_issues_no_request() {
        let mut h = harness(FakeApi::default());
        let err = h.session.send_message(OutgoingMessage::text("hi")).unwrap_err();
        assert!(matches!(err, ChatError::NoSelectedUser));
        h.session.settle().await;
        assert!(h.api.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_conversation_flow() {
        let api = FakeApi::default();
        api.histories.lock().unwrap().insert("u1".into(), vec![message("m1", "u1", "me")]);
        let mut h = harness(api);

        h.session.set_selected_user(Some(user("u1", "Ada"))).unwrap();
        h.session.load_messages("u1").unwrap();
        h.session.settle().await;
        assert!(h.session.has_unread("u1"));

        h.session.mark_as_read("u1").unwrap();
        h.session.send_message(OutgoingMessage::text("hi back")).unwrap();
        h.session.settle().await;

        assert!(!h.session.has_unread("u1"));
        assert!(!h.session.state().messages_loading());
        assert_eq!(h.session.state().messages().len(), 2);
        assert_eq!(h.api.sent.lock().unwrap()[0].0, "u1");
    }

    #[tokio::test]
    async fn failed_mark_read_stays_silent() {
        let api = FakeApi { fail_mark_read: true, ..FakeApi::default() };
        let mut h = harness(api);
        h.session.mark_as_read("u1").unwrap();
        h.session.settle().await;
        assert!(h.notes.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cached_roster_seeds_and_refreshes() {
        let api = FakeApi::default();
        *api.users.lock().unwrap() = Some(Ok(json!([{ "_id": "u2", "fullName": "Grace" }])));
        let api = Arc::new(api);
        let cache = UserCache::open_in_memory().unwrap();
        cache.upsert_users(&[user("u1", "Ada")]).unwrap();

        let mut session = ChatSession::new(api, Realtime::new(), Arc::new(Recorder::default()), Arc::new(BrokenSpeaker(AtomicUsize::new(0))))
            .with_cache(cache);
        session.restore_cached_users(50).unwrap();
        assert_eq!(session.state().users(), &[user("u1", "Ada")]);

        session.load_users().unwrap();
        session.settle().await;
        assert_eq!(session.state().users(), &[user("u2", "Grace")]);
        let cached = session.cache.as_ref().unwrap().cached_users(50).unwrap();
        assert_eq!(cached.len(), 2);
    }
}
