pub mod notify;
pub mod terminal;
