//! Chat session state and the reducer that drives it.
//!
//! `ChatState::apply` takes one [`Action`], updates the state in place and
//! returns the [`Effect`]s the caller has to carry out: requests to issue,
//! realtime handlers to (un)install, toasts to show. Completed requests come
//! back in as actions, so every state change goes through `apply`.

use crate::api::error::ApiError;
use crate::api::events::NEW_MESSAGE;
use crate::api::models::{Message, OutgoingMessage, User};
use crate::error::ChatError;
use crate::ui::notify::Notification;

pub const NOTIFICATION_VOLUME: f32 = 0.3;

pub type RequestId = u64;

#[derive(Debug)]
pub enum Action {
    LoadUsers,
    UsersLoaded(Result<Vec<User>, ApiError>),
    /// Roster read from the local cache at start-up.
    UsersRestored(Vec<User>),
    LoadMessages(String),
    MessagesLoaded {
        request: RequestId,
        user_id: String,
        result: Result<Vec<Message>, ApiError>,
    },
    SendMessage(OutgoingMessage),
    MessageSent {
        recipient_id: String,
        result: Result<Message, ApiError>,
    },
    MarkAsRead(String),
    MarkedRead {
        user_id: String,
        result: Result<(), ApiError>,
    },
    SelectUser(Option<User>),
    Subscribe,
    Unsubscribe,
    Incoming(Message),
    /// A request task ended without reporting back (it panicked or was cancelled).
    RequestAbandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    FetchUsers,
    FetchMessages { request: RequestId, user_id: String },
    Send { recipient_id: String, payload: OutgoingMessage },
    MarkRead { user_id: String },
    CacheUsers(Vec<User>),
    Subscribe(&'static str),
    Unsubscribe(&'static str),
    Notify(Notification),
    PlaySound { volume: f32 },
}

#[derive(Debug, Default, Clone)]
pub struct ChatState {
    messages: Vec<Message>,
    users: Vec<User>,
    selected_user: Option<User>,
    users_loading: bool,
    messages_loading: bool,
    subscribed: bool,
    next_request: RequestId,
    // Only the most recent history request may write the message list.
    pending_messages: Option<RequestId>,
    // Set when a mark-read succeeds while that history is still loading.
    read_on_arrival: Option<String>,
}

impl ChatState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn users(&self) -> &[User] {
        &self.users
    }

    pub fn selected_user(&self) -> Option<&User> {
        self.selected_user.as_ref()
    }

    pub fn users_loading(&self) -> bool {
        self.users_loading
    }

    pub fn messages_loading(&self) -> bool {
        self.messages_loading
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn has_unread(&self, user_id: &str) -> bool {
        self.messages.iter().any(|m| m.sender_id == user_id && !m.read)
    }

    pub fn find_user(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|u| u.id == id)
    }

    fn is_selected(&self, user_id: &str) -> bool {
        self.selected_user.as_ref().is_some_and(|u| u.id == user_id)
    }

    fn sender_label(&self, msg: &Message) -> String {
        self.find_user(&msg.sender_id)
            .map(|u| u.full_name.as_str())
            .filter(|name| !name.is_empty())
            .or(msg.sender_name.as_deref())
            .unwrap_or("Unknown")
            .to_string()
    }

    pub fn apply(&mut self, action: Action) -> Result<Vec<Effect>, ChatError> {
        let effects = match action {
            Action::LoadUsers => {
                self.users_loading = true;
                vec![Effect::FetchUsers]
            }
            Action::UsersLoaded(result) => {
                self.users_loading = false;
                match result {
                    Ok(users) => {
                        self.users = users.clone();
                        vec![Effect::CacheUsers(users)]
                    }
                    Err(e) => {
                        log::warn!("fetching users failed: {e}");
                        vec![Effect::Notify(Notification::error(e.user_message("Error fetching users")))]
                    }
                }
            }
            Action::UsersRestored(users) => {
                if self.users.is_empty() {
                    self.users = users;
                }
                Vec::new()
            }
            Action::LoadMessages(user_id) => {
                self.next_request += 1;
                let request = self.next_request;
                self.pending_messages = Some(request);
                self.messages_loading = true;
                vec![Effect::FetchMessages { request, user_id }]
            }
            Action::MessagesLoaded { request, user_id, result } => self.messages_loaded(request, &user_id, result),
            Action::SendMessage(payload) => {
                let recipient = self.selected_user.as_ref().ok_or(ChatError::NoSelectedUser)?;
                vec![Effect::Send { recipient_id: recipient.id.clone(), payload }]
            }
            Action::MessageSent { recipient_id, result } => match result {
                Ok(msg) => {
                    if self.is_selected(&recipient_id) {
                        self.messages.push(msg);
                    } else {
                        log::debug!("sent message to {recipient_id} after switching conversation, not appended");
                    }
                    Vec::new()
                }
                Err(e) => {
                    log::warn!("sending message to {recipient_id} failed: {e}");
                    vec![Effect::Notify(Notification::error(e.user_message("Error sending message")))]
                }
            },
            Action::MarkAsRead(user_id) => vec![Effect::MarkRead { user_id }],
            Action::MarkedRead { user_id, result } => {
                match result {
                    Ok(()) => {
                        self.mark_read_locally(&user_id);
                        if self.pending_messages.is_some() {
                            self.read_on_arrival = Some(user_id);
                        }
                    }
                    Err(e) => log::error!("Error marking messages as read: {e}"),
                }
                Vec::new()
            }
            Action::SelectUser(user) => {
                self.selected_user = user;
                Vec::new()
            }
            Action::Subscribe => {
                self.subscribed = true;
                vec![Effect::Unsubscribe(NEW_MESSAGE), Effect::Subscribe(NEW_MESSAGE)]
            }
            Action::Unsubscribe => {
                self.subscribed = false;
                vec![Effect::Unsubscribe(NEW_MESSAGE)]
            }
            Action::Incoming(msg) => self.incoming(msg),
            Action::RequestAbandoned => {
                log::error!("a request task ended without a result");
                Vec::new()
            }
        };
        Ok(effects)
    }

    fn messages_loaded(&mut self, request: RequestId, user_id: &str, result: Result<Vec<Message>, ApiError>) -> Vec<Effect> {
        if self.pending_messages != Some(request) {
            log::debug!("dropping superseded history response #{request} for {user_id}");
            return Vec::new();
        }
        self.pending_messages = None;
        self.messages_loading = false;
        let read_on_arrival = self.read_on_arrival.take();

        if self.selected_user.as_ref().is_some_and(|u| u.id != user_id) {
            log::debug!("dropping history for {user_id}, no longer selected");
            return Vec::new();
        }
        match result {
            Ok(messages) => {
                self.messages = messages;
                if read_on_arrival.as_deref() == Some(user_id) {
                    self.mark_read_locally(user_id);
                }
                Vec::new()
            }
            Err(e) => {
                log::warn!("fetching messages for {user_id} failed: {e}");
                vec![Effect::Notify(Notification::error(e.user_message("Error fetching messages")))]
            }
        }
    }

    fn mark_read_locally(&mut self, sender_id: &str) {
        for msg in self.messages.iter_mut().filter(|m| m.sender_id == sender_id) {
            msg.read = true;
        }
    }

    fn incoming(&mut self, msg: Message) -> Vec<Effect> {
        if !self.subscribed {
            log::debug!("dropping message {} delivered after unsubscribe", msg.id);
            return Vec::new();
        }
        if self.is_selected(&msg.sender_id) {
            if !self.messages.iter().any(|m| m.id == msg.id) {
                self.messages.push(msg);
            }
            return Vec::new();
        }
        let name = self.sender_label(&msg);
        vec![
            Effect::Notify(Notification::info(format!("New message from {name}"))),
            Effect::PlaySound { volume: NOTIFICATION_VOLUME },
        ]
    }
}
