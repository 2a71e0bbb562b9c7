pub mod config;
pub mod console_speech;
pub mod terminal;
