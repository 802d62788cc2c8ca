use crate::api::models::{Message, OutgoingMessage, User};
use crate::error::ChatError;
use crate::session::ChatSession;
use crate::store::ChatState;
use crate::ui::notify::Notification;
use std::io::{self, Write};

pub const HELP: &str = "\
Commands:
  /users          refresh and list conversations
  /open <who>     open a conversation by id or name
  /close          leave the current conversation
  /help           show this help
  /quit           exit
Anything else is sent to the open conversation.";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Users,
    Open(String),
    Close,
    Help,
    Quit,
    Send(String),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Some(Command::Send(line.to_string()));
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };
        Some(match name {
            "users" => Command::Users,
            "open" if !arg.is_empty() => Command::Open(arg.to_string()),
            "close" => Command::Close,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(line.to_string()),
        })
    }
}

/// Finds a user by exact id, then by case-insensitive name prefix.
pub fn find_user<'a>(users: &'a [User], query: &str) -> Option<&'a User> {
    if let Some(u) = users.iter().find(|u| u.id == query) {
        return Some(u);
    }
    let needle = query.to_lowercase();
    users.iter().find(|u| u.full_name.to_lowercase().starts_with(&needle))
}

/// Tracks what has already been printed so only changes are rendered.
#[derive(Debug, Default)]
pub struct View {
    shown_messages: usize,
    users_loading: bool,
    messages_loading: bool,
}

impl View {
    pub fn refresh(&mut self, state: &ChatState, out: &mut impl Write) -> io::Result<()> {
        if self.users_loading && !state.users_loading() {
            render_roster(state, out)?;
        }
        self.users_loading = state.users_loading();

        let history_arrived = self.messages_loading && !state.messages_loading();
        self.messages_loading = state.messages_loading();
        let messages = state.messages();
        if history_arrived || messages.len() < self.shown_messages {
            self.shown_messages = 0;
        }
        for msg in &messages[self.shown_messages..] {
            writeln!(out, "{}", format_message(msg, state.selected_user()))?;
        }
        self.shown_messages = messages.len();
        Ok(())
    }
}

pub fn render_roster(state: &ChatState, out: &mut impl Write) -> io::Result<()> {
    if state.users().is_empty() {
        return writeln!(out, "No conversations yet.");
    }
    for u in state.users() {
        let mark = if state.has_unread(&u.id) { '*' } else { ' ' };
        writeln!(out, "{mark} {:<24} {}", u.display_name(), u.id)?;
    }
    Ok(())
}

pub fn format_message(msg: &Message, partner: Option<&User>) -> String {
    let who = match partner {
        Some(p) if p.id == msg.sender_id => p.display_name(),
        Some(_) => "you",
        None => msg.sender_name.as_deref().unwrap_or("you"),
    };
    let time = msg.created_at.with_timezone(&chrono::Local).format("%H:%M");
    let mut line = format!("[{time}] {who}: {}", msg.content);
    if let Some(image) = &msg.image {
        line.push_str(&format!(" <image {image}>"));
    }
    line
}

/// Runs one command against the session. Returns `false` when the user quits.
pub fn execute(session: &mut ChatSession, cmd: Command, out: &mut impl Write) -> Result<bool, ChatError> {
    match cmd {
        Command::Users => session.load_users()?,
        Command::Open(query) => {
            let Some(user) = find_user(session.state().users(), &query).cloned() else {
                session.notify(Notification::error(format!("No conversation matches {query:?}")));
                return Ok(true);
            };
            let _ = writeln!(out, "--- {} ---", user.display_name());
            let id = user.id.clone();
            session.set_selected_user(Some(user))?;
            session.load_messages(&id)?;
            session.mark_as_read(&id)?;
        }
        Command::Close => session.set_selected_user(None)?,
        Command::Help => {
            let _ = writeln!(out, "{HELP}");
        }
        Command::Quit => return Ok(false),
        Command::Send(text) => match session.send_message(OutgoingMessage::text(text)) {
            Err(ChatError::NoSelectedUser) => {
                session.notify(Notification::error("Open a conversation with /open first"));
            }
            other => other?,
        },
        Command::Unknown(line) => {
            session.notify(Notification::error(format!("Unknown command {line:?}, try /help")));
        }
    }
    Ok(true)
}
