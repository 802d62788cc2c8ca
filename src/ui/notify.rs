use std::io::Write;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Error,
}

/// A transient, non-blocking message for the user. Not a log line.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub level: Level,
    pub text: String,
    pub duration: Duration,
}

impl Notification {
    pub fn info(text: impl Into<String>) -> Self {
        Self { level: Level::Info, text: text.into(), duration: Duration::from_secs(5) }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self { level: Level::Error, text: text.into(), duration: Duration::from_secs(4) }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

#[derive(Debug, Error)]
pub enum SoundError {
    #[error("sound output unavailable: {0}")]
    Unavailable(#[from] std::io::Error),
    #[error("sound muted")]
    Muted,
}

/// Plays the incoming-message sound.
pub trait Chime: Send + Sync {
    fn play(&self, volume: f32) -> Result<(), SoundError>;
}

/// Prints toasts to stderr so they do not interleave with the transcript.
pub struct TerminalNotifier;

impl Notifier for TerminalNotifier {
    fn notify(&self, n: &Notification) {
        let tag = match n.level {
            Level::Info => "*",
            Level::Error => "!",
        };
        eprintln!("[{tag}] {}", n.text);
    }
}

/// Rings the terminal bell. A zero volume counts as muted.
pub struct TerminalBell {
    pub muted: bool,
}

impl Chime for TerminalBell {
    fn play(&self, volume: f32) -> Result<(), SoundError> {
        if self.muted || volume <= 0.0 {
            return Err(SoundError::Muted);
        }
        let mut out = std::io::stdout().lock();
        out.write_all(b"\x07")?;
        out.flush()?;
        Ok(())
    }
}
