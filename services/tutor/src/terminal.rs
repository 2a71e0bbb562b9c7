//! Line-oriented front end: turns typed lines into UI inputs and controller
//! updates into transcript lines.

use talkers_core::Update;
use talkers_core::agent::LearningMode;
use talkers_core::controller::{Screen, TurnState, UiInput};
use talkers_core::message::MessageRole;

pub const HELP: &str = "\
Commands:
  /topics          choose a topic
  /topic <name>    pick a topic, e.g. /topic Animals
  /mode chat|words start talking or learning words
  /mic             start or stop listening
  /back            go back one screen
  /quit            leave
Anything else is sent to the teacher.";

pub const SUGGESTED_TOPICS: [&str; 6] = ["Animals", "Food", "Family", "Colors", "Toys", "Weather"];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Input(UiInput),
    Help,
    Quit,
}

pub fn parse_mode(value: &str) -> Option<LearningMode> {
    match value.trim().to_lowercase().as_str() {
        "chat" | "conversation" => Some(LearningMode::Conversation),
        "words" | "vocabulary" => Some(LearningMode::Vocabulary),
        _ => None,
    }
}

/// Interprets one line typed at the prompt. Blank lines mean nothing.
pub fn parse_line(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Input(UiInput::SubmitText(line.to_string())));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let command = match name {
        "topics" => Command::Input(UiInput::OpenTopics),
        "topic" => Command::Input(UiInput::SelectTopic(arg.to_string())),
        "mode" => match parse_mode(arg) {
            Some(mode) => Command::Input(UiInput::SelectMode(mode)),
            None => Command::Help,
        },
        "mic" => Command::Input(UiInput::ToggleRecording),
        "back" => Command::Input(UiInput::Back),
        "quit" | "exit" => Command::Quit,
        _ => Command::Help,
    };
    Some(command)
}

/// The transcript line for an update, if it shows as one.
pub fn render(update: &Update) -> Option<String> {
    match update {
        Update::Screen(Screen::Landing) => {
            Some("Welcome to Little Talkers! Type /topics to begin.".to_string())
        }
        Update::Screen(Screen::TopicSelect) => Some(format!(
            "Pick a topic with /topic <name>. Ideas: {}.",
            SUGGESTED_TOPICS.join(", ")
        )),
        Update::Screen(Screen::ModeSelect { topic }) => Some(format!(
            "Topic: {topic}. Type /mode chat to talk, or /mode words to learn words."
        )),
        Update::Screen(Screen::Chat { topic, mode }) => Some(format!(
            "--- {topic} ({mode}) --- type your answer, /mic to talk, /back to leave"
        )),
        Update::Turn(TurnState::Processing) => Some("(thinking...)".to_string()),
        Update::Turn(TurnState::Listening) => Some("(listening...)".to_string()),
        Update::Turn(TurnState::Idle | TurnState::Speaking) => None,
        Update::Appended(message) => {
            let speaker = match message.role {
                MessageRole::Child => "You",
                MessageRole::Tutor => "Teacher",
            };
            Some(format!("{speaker}: {}", message.text))
        }
        Update::Cleared => None,
        Update::Rejected(e) => Some(format!("(!) {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkers_core::controller::ControllerError;
    use talkers_core::message::MessageLog;

    #[test]
    fn test_parse_line_commands() {
        assert_eq!(
            parse_line("/topic  Space Animals "),
            Some(Command::Input(UiInput::SelectTopic(
                "Space Animals".to_string()
            )))
        );
        assert_eq!(
            parse_line("/mode words"),
            Some(Command::Input(UiInput::SelectMode(LearningMode::Vocabulary)))
        );
        assert_eq!(parse_line("/mode sing"), Some(Command::Help));
        assert_eq!(
            parse_line("/mic"),
            Some(Command::Input(UiInput::ToggleRecording))
        );
        assert_eq!(parse_line("/quit"), Some(Command::Quit));
        assert_eq!(parse_line("/dance"), Some(Command::Help));
    }

    #[test]
    fn test_parse_line_text_and_blank() {
        assert_eq!(parse_line("   "), None);
        assert_eq!(
            parse_line("  I like dogs "),
            Some(Command::Input(UiInput::SubmitText("I like dogs".to_string())))
        );
    }

    #[test]
    fn test_render_transcript_lines() {
        let mut log = MessageLog::new();
        let child = log.append(MessageRole::Child, "cat").clone();
        let tutor = log.append(MessageRole::Tutor, "Good job! 🌟").clone();

        assert_eq!(render(&Update::Appended(child)), Some("You: cat".to_string()));
        assert_eq!(
            render(&Update::Appended(tutor)),
            Some("Teacher: Good job! 🌟".to_string())
        );
        assert_eq!(render(&Update::Turn(TurnState::Speaking)), None);
        assert_eq!(
            render(&Update::Rejected(ControllerError::NoSession)),
            Some("(!) no tutoring session is active".to_string())
        );
    }
}
