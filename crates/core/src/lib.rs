pub mod agent;
pub mod controller;
pub mod llm_client;
pub mod message;
pub mod retry;
pub mod speech;
pub mod timer;

use controller::{ControllerError, Screen, TurnState};
use message::Message;

/// Represents changes the session controller publishes to the presentation layer.
///
/// Presentation never reads controller state directly while a session runs;
/// it renders from this stream (indicator, transcript, current screen).
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// The visible screen changed.
    Screen(Screen),
    /// The turn indicator changed.
    Turn(TurnState),
    /// A message was added to the transcript.
    Appended(Message),
    /// The transcript was discarded with its session.
    Cleared,
    /// A UI input was refused; the UI may offer an alternative (e.g. typing).
    Rejected(ControllerError),
}
