mod api;
mod app;
mod error;
mod session;
mod storage;
mod store;
mod ui;
mod utils;

use crate::api::client::ApiClient;
use crate::api::socket::{self, Realtime};
use crate::app::AppState;
use crate::error::ChatError;
use crate::session::ChatSession;
use crate::storage::UserCache;
use crate::ui::notify::{Notification, Notifier, TerminalBell, TerminalNotifier};
use crate::ui::terminal::{self, Command, View};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Parser)]
#[command(name = "chatline", version, about = "Terminal chat client")]
struct Cli {
    /// API base URL, e.g. http://localhost:5001/api
    #[arg(long, env = "CHATLINE_BASE_URL")]
    base_url: Option<String>,
    /// Socket.IO server URL; defaults to the API host
    #[arg(long, env = "CHATLINE_SOCKET_URL")]
    socket_url: Option<String>,
    /// Your user id, used to route realtime messages
    #[arg(long, env = "CHATLINE_USER_ID")]
    user_id: Option<String>,
    #[arg(long, env = "CHATLINE_TOKEN", hide_env_values = true)]
    token: Option<String>,
    #[arg(long)]
    no_sound: bool,
    /// Write the effective settings back to the config file
    #[arg(long)]
    save: bool,
}

impl Cli {
    fn apply(self, state: &mut AppState) -> bool {
        if let Some(url) = self.base_url {
            state.base_url = utils::normalize_url(&url);
        }
        if let Some(url) = self.socket_url {
            state.socket_url = Some(utils::normalize_url(&url));
        }
        if self.user_id.is_some() {
            state.user_id = self.user_id;
        }
        if self.token.is_some() {
            state.token = self.token;
        }
        if self.no_sound {
            state.sound = false;
        }
        self.save
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    if let Err(e) = run(Cli::parse()).await {
        log::error!("{e}");
        eprintln!("chatline: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), ChatError> {
    let mut state = AppState::load();
    if cli.apply(&mut state) {
        state.save()?;
    }

    let api = Arc::new(ApiClient::new(&state.base_url, state.token.clone())?);
    let realtime = Realtime::new();
    let notifier = Arc::new(TerminalNotifier);
    let chime = Arc::new(TerminalBell { muted: !state.sound });
    let mut session = ChatSession::new(api, realtime.clone(), notifier.clone(), chime);

    if let Some(path) = storage::db_path() {
        match UserCache::open(&path) {
            Ok(cache) => session = session.with_cache(cache),
            Err(e) => log::warn!("roster cache unavailable: {e}"),
        }
    }
    session.restore_cached_users(200)?;

    let url = socket::socket_url(state.socket_base(), state.user_id.as_deref())?;
    let _socket = match socket::connect(url, realtime).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::warn!("realtime connection failed: {e}");
            notifier.notify(&Notification::error("Realtime updates unavailable"));
            None
        }
    };

    session.subscribe_to_incoming()?;
    session.load_users()?;

    let mut stdout = std::io::stdout();
    let mut view = View::default();
    let _ = writeln!(stdout, "{}", terminal::HELP);
    if !session.state().users().is_empty() {
        let _ = terminal::render_roster(session.state(), &mut stdout);
    }
    // Records the in-flight roster fetch so its result gets printed.
    let _ = view.refresh(session.state(), &mut stdout);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(cmd) = Command::parse(&line) else { continue };
                    if !terminal::execute(&mut session, cmd, &mut stdout)? {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("reading input failed: {e}");
                    break;
                }
            },
            more = session.next() => {
                if !more {
                    break;
                }
            }
        }
        if let Err(e) = view.refresh(session.state(), &mut stdout) {
            log::warn!("rendering failed: {e}");
        }
    }

    session.unsubscribe_from_incoming()?;
    Ok(())
}
