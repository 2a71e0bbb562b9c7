//! Session Controller
//!
//! The turn-taking state machine of a tutoring session. It owns the turn
//! state, the transcript, the inactivity watchdog and the conversation held
//! with the chat model, and it is the only place any of them change.
//!
//! Asynchronous work (chat calls, capture, synthesis, the watchdog) runs in
//! spawned tasks that post their completion back into a single event queue.
//! The controller handles those completions one at a time, so no state is
//! shared across tasks. Each completion carries the session it belongs to;
//! completions for a session that has since been torn down are dropped.

use crate::Update;
use crate::agent::{AgentSession, ConversationAgent, LearningMode, TIMEOUT_SENTINEL};
use crate::message::{Message, MessageLog, MessageRole};
use crate::speech::{CaptureError, SpeechCapability};
use crate::timer::{InactivityTimer, TimerTicket};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pause between a finished capture and dispatching its transcript, giving
/// the recognizer time to shut down.
pub const CAPTURE_SETTLE_DELAY: Duration = Duration::from_millis(200);

/// What the session is doing right now.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    /// Nothing in flight; the child may speak or type, or the watchdog may fire.
    Idle,
    /// A capture is running.
    Listening,
    /// A chat call is in flight.
    Processing,
    /// The tutor's reply is being spoken.
    Speaking,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Landing,
    TopicSelect,
    ModeSelect { topic: String },
    Chat { topic: String, mode: LearningMode },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("the tutor is busy ({0:?})")]
    Busy(TurnState),
    #[error("no tutoring session is active")]
    NoSession,
    #[error("no topic has been chosen")]
    NoTopic,
    #[error("speech recognition is not supported here, please type instead")]
    CaptureUnsupported,
}

/// Generation number of a tutoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

type CaptureId = u64;

/// Everything the presentation layer can ask of the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum UiInput {
    OpenTopics,
    SelectTopic(String),
    SelectMode(LearningMode),
    SubmitText(String),
    ToggleRecording,
    Back,
}

/// Completion of asynchronous work started by the controller.
#[derive(Debug)]
enum Event {
    AgentReplied {
        session: SessionId,
        agent: AgentSession,
        reply: String,
    },
    SpeechFinished {
        session: SessionId,
    },
    CaptureEnded {
        session: SessionId,
        capture: CaptureId,
        result: Result<String, CaptureError>,
    },
    UtteranceSettled {
        session: SessionId,
        text: String,
    },
    TimerFired {
        ticket: TimerTicket,
    },
}

struct ActiveSession {
    id: SessionId,
    /// Lent to the chat call in flight; `None` until it comes back.
    agent: Option<AgentSession>,
}

pub struct SessionController {
    agent: Arc<ConversationAgent>,
    speech: Arc<dyn SpeechCapability>,
    timer: InactivityTimer,
    screen: Screen,
    turn: TurnState,
    log: MessageLog,
    session: Option<ActiveSession>,
    next_session: u64,
    capture: Option<CaptureId>,
    next_capture: CaptureId,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    updates: Option<mpsc::UnboundedSender<Update>>,
}

impl SessionController {
    pub fn new(
        agent: Arc<ConversationAgent>,
        speech: Arc<dyn SpeechCapability>,
        inactivity_timeout: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            agent,
            speech,
            timer: InactivityTimer::new(inactivity_timeout),
            screen: Screen::Landing,
            turn: TurnState::Idle,
            log: MessageLog::new(),
            session: None,
            next_session: 0,
            capture: None,
            next_capture: 0,
            events_tx,
            events_rx,
            updates: None,
        }
    }

    /// Publishes every state change on `updates`.
    pub fn with_updates(mut self, updates: mpsc::UnboundedSender<Update>) -> Self {
        self.updates = Some(updates);
        self
    }

    pub fn turn_state(&self) -> TurnState {
        self.turn
    }

    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn messages(&self) -> &[Message] {
        self.log.messages()
    }

    /// When the watchdog will fire, if it is armed.
    pub fn inactivity_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    // --- Navigation ---

    pub fn open_topics(&mut self) {
        if self.screen == Screen::Landing {
            self.set_screen(Screen::TopicSelect);
        }
    }

    pub fn select_topic(&mut self, topic: &str) -> Result<(), ControllerError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ControllerError::NoTopic);
        }
        self.teardown();
        self.set_screen(Screen::ModeSelect {
            topic: topic.to_string(),
        });
        Ok(())
    }

    /// Starts a session on the topic chosen earlier.
    pub fn select_mode(&mut self, mode: LearningMode) -> Result<(), ControllerError> {
        let topic = match &self.screen {
            Screen::ModeSelect { topic } | Screen::Chat { topic, .. } => topic.clone(),
            _ => return Err(ControllerError::NoTopic),
        };
        self.start_session(&topic, mode)
    }

    // --- Session operations ---

    /// Replaces any current session with a new one and asks for its greeting.
    pub fn start_session(&mut self, topic: &str, mode: LearningMode) -> Result<(), ControllerError> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(ControllerError::NoTopic);
        }
        self.teardown();

        self.next_session += 1;
        let id = SessionId(self.next_session);
        info!(session = id.0, %topic, %mode, "Starting tutoring session");
        self.session = Some(ActiveSession { id, agent: None });
        self.set_screen(Screen::Chat {
            topic: topic.to_string(),
            mode,
        });
        self.set_turn(TurnState::Processing);

        let agent = Arc::clone(&self.agent);
        let events = self.events_tx.clone();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let (session, greeting) = agent.initialize(&topic, mode).await;
            let _ = events.send(Event::AgentReplied {
                session: id,
                agent: session,
                reply: greeting,
            });
        });
        Ok(())
    }

    /// Sends what the child said or typed to the tutor.
    ///
    /// Blank text is ignored. A running capture is stopped first.
    pub fn handle_user_utterance(&mut self, text: &str) -> Result<(), ControllerError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        self.ensure_ready()?;
        if self.turn == TurnState::Listening {
            self.halt_capture();
        }
        self.timer.cancel();

        let message = self.log.append(MessageRole::Child, text).clone();
        self.publish(Update::Appended(message));
        self.begin_exchange(text.to_string());
        Ok(())
    }

    /// Asks the tutor for a bilingual hint after the child went quiet.
    ///
    /// Runs when the watchdog fires; ignored unless the session is idle or
    /// listening. No transcript entry is made for the request itself.
    pub fn on_inactivity_timeout(&mut self) {
        self.timer.cancel();
        if let Err(e) = self.ensure_ready() {
            debug!(reason = %e, "Ignoring inactivity timeout");
            return;
        }
        if self.turn == TurnState::Listening {
            self.halt_capture();
        }
        info!("Child went quiet, asking the tutor for a hint");
        self.begin_exchange(TIMEOUT_SENTINEL.to_string());
    }

    /// Starts a capture when idle, or stops the running one.
    pub fn toggle_recording(&mut self) -> Result<(), ControllerError> {
        let session = self.ensure_ready()?;
        if self.turn == TurnState::Listening {
            self.halt_capture();
            self.finish_turn();
            return Ok(());
        }
        if !self.speech.supports_capture() {
            return Err(ControllerError::CaptureUnsupported);
        }

        self.timer.cancel();
        self.next_capture += 1;
        let capture = self.next_capture;
        self.capture = Some(capture);
        self.set_turn(TurnState::Listening);

        let speech = Arc::clone(&self.speech);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = speech.listen().await;
            let _ = events.send(Event::CaptureEnded {
                session,
                capture,
                result,
            });
        });
        Ok(())
    }

    /// Tears the session down and walks one screen back.
    pub fn go_back(&mut self) {
        let screen = self.screen.clone();
        self.teardown();
        match screen {
            Screen::Chat { topic, .. } => self.set_screen(Screen::ModeSelect { topic }),
            Screen::ModeSelect { .. } => self.set_screen(Screen::TopicSelect),
            Screen::TopicSelect | Screen::Landing => {}
        }
    }

    pub fn apply(&mut self, input: UiInput) -> Result<(), ControllerError> {
        match input {
            UiInput::OpenTopics => {
                self.open_topics();
                Ok(())
            }
            UiInput::SelectTopic(topic) => self.select_topic(&topic),
            UiInput::SelectMode(mode) => self.select_mode(mode),
            UiInput::SubmitText(text) => self.handle_user_utterance(&text),
            UiInput::ToggleRecording => self.toggle_recording(),
            UiInput::Back => {
                self.go_back();
                Ok(())
            }
        }
    }

    // --- Event loop ---

    /// Waits for the next completion and handles it.
    pub async fn step(&mut self) -> bool {
        match self.events_rx.recv().await {
            Some(event) => {
                self.handle_event(event);
                true
            }
            None => false,
        }
    }

    /// Serves UI inputs and completions until the input channel closes.
    pub async fn run(mut self, mut inputs: mpsc::Receiver<UiInput>) {
        loop {
            tokio::select! {
                input = inputs.recv() => match input {
                    Some(input) => {
                        if let Err(e) = self.apply(input) {
                            debug!(error = %e, "UI input rejected");
                            self.publish(Update::Rejected(e));
                        }
                    }
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
        self.teardown();
        info!("Session controller stopped.");
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::TimerFired { ticket } => {
                if self.timer.take_fired(ticket) {
                    self.on_inactivity_timeout();
                } else {
                    debug!(ticket, "Dropping stale inactivity timer");
                }
            }
            Event::AgentReplied {
                session,
                agent,
                reply,
            } => {
                match self.session.as_mut() {
                    Some(active) if active.id == session => active.agent = Some(agent),
                    _ => {
                        debug!(session = session.0, "Dropping reply for a closed session");
                        return;
                    }
                }
                let message = self.log.append(MessageRole::Tutor, reply.clone()).clone();
                self.publish(Update::Appended(message));
                self.speak(session, reply);
            }
            Event::SpeechFinished { session } => {
                if self.is_current(session) && self.turn == TurnState::Speaking {
                    self.finish_turn();
                } else {
                    debug!(session = session.0, "Dropping stale speech completion");
                }
            }
            Event::CaptureEnded {
                session,
                capture,
                result,
            } => {
                if !self.is_current(session) || self.capture != Some(capture) {
                    debug!(capture, "Dropping result of a stopped capture");
                    return;
                }
                self.capture = None;
                match result {
                    Ok(text) => {
                        info!(%text, "Child said");
                        self.speech.stop_listening();
                        let events = self.events_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(CAPTURE_SETTLE_DELAY).await;
                            let _ = events.send(Event::UtteranceSettled { session, text });
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Speech capture failed");
                        self.finish_turn();
                    }
                }
            }
            Event::UtteranceSettled { session, text } => {
                if !self.is_current(session) {
                    return;
                }
                if text.trim().is_empty() {
                    if self.turn == TurnState::Listening {
                        self.finish_turn();
                    }
                    return;
                }
                if let Err(e) = self.handle_user_utterance(&text) {
                    debug!(error = %e, "Dropping utterance heard while busy");
                }
            }
        }
    }

    // --- Internals ---

    /// The current session, if it can take a new turn right now.
    fn ensure_ready(&self) -> Result<SessionId, ControllerError> {
        let session = self.session.as_ref().ok_or(ControllerError::NoSession)?;
        match self.turn {
            TurnState::Processing | TurnState::Speaking => Err(ControllerError::Busy(self.turn)),
            _ if session.agent.is_none() => Err(ControllerError::Busy(TurnState::Processing)),
            _ => Ok(session.id),
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.session_id() == Some(session)
    }

    /// Lends the conversation to a chat call for `text`.
    fn begin_exchange(&mut self, text: String) {
        let Some(active) = self.session.as_mut() else {
            return;
        };
        let Some(mut conversation) = active.agent.take() else {
            return;
        };
        let session = active.id;
        self.set_turn(TurnState::Processing);

        let agent = Arc::clone(&self.agent);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let reply = agent.send(&mut conversation, &text).await;
            let _ = events.send(Event::AgentReplied {
                session,
                agent: conversation,
                reply,
            });
        });
    }

    fn speak(&mut self, session: SessionId, text: String) {
        self.set_turn(TurnState::Speaking);
        let speech = Arc::clone(&self.speech);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            speech.speak(&text).await;
            let _ = events.send(Event::SpeechFinished { session });
        });
    }

    fn halt_capture(&mut self) {
        self.speech.stop_listening();
        self.capture = None;
    }

    /// Closes every turn, successful or not: back to idle, watchdog armed.
    fn finish_turn(&mut self) {
        self.set_turn(TurnState::Idle);
        let events = self.events_tx.clone();
        self.timer.arm(move |ticket| {
            let _ = events.send(Event::TimerFired { ticket });
        });
    }

    /// Hard reset: no timer, no speech I/O, no session, empty transcript.
    fn teardown(&mut self) {
        self.timer.cancel();
        match self.turn {
            TurnState::Speaking => self.speech.stop_speaking(),
            TurnState::Listening => self.halt_capture(),
            TurnState::Idle | TurnState::Processing => {}
        }
        if let Some(session) = self.session.take() {
            info!(session = session.id.0, "Tutoring session closed");
        }
        if !self.log.is_empty() {
            self.log.clear();
            self.publish(Update::Cleared);
        }
        self.set_turn(TurnState::Idle);
    }

    fn set_turn(&mut self, turn: TurnState) {
        if self.turn != turn {
            debug!(from = ?self.turn, to = ?turn, "Turn state changed");
            self.turn = turn;
            self.publish(Update::Turn(turn));
        }
    }

    fn set_screen(&mut self, screen: Screen) {
        if self.screen != screen {
            self.screen = screen.clone();
            self.publish(Update::Screen(screen));
        }
    }

    fn publish(&self, update: Update) {
        if let Some(tx) = &self.updates {
            if tx.send(update).is_err() {
                warn!("Failed to publish update: receiver dropped.");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{FALLBACK_REPLY, MockChatTransport};
    use crate::retry::RetryPolicy;
    use crate::speech::MockSpeechCapability;
    use crate::timer::DEFAULT_INACTIVITY_TIMEOUT;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    const GREETING: &str = "Hi! Let's talk about animals!";
    const HINT: &str = "Con thích con vật nào? Which animal do you like?";

    /// Speaks instantly and hears whatever the test scripted. An unscripted
    /// capture waits until it is stopped.
    #[derive(Default)]
    struct FakeSpeech {
        spoken: Mutex<Vec<String>>,
        captures: Mutex<VecDeque<Result<String, CaptureError>>>,
        listens: AtomicUsize,
        stop_listening_calls: AtomicUsize,
        stop_speaking_calls: AtomicUsize,
        stopped: Notify,
    }

    impl FakeSpeech {
        fn hearing(result: Result<String, CaptureError>) -> Self {
            let speech = Self::default();
            speech.captures.lock().unwrap().push_back(result);
            speech
        }

        fn spoken(&self) -> Vec<String> {
            self.spoken.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SpeechCapability for FakeSpeech {
        fn supports_capture(&self) -> bool {
            true
        }

        async fn listen(&self) -> Result<String, CaptureError> {
            self.listens.fetch_add(1, Ordering::SeqCst);
            let scripted = self.captures.lock().unwrap().pop_front();
            match scripted {
                Some(result) => result,
                None => {
                    self.stopped.notified().await;
                    Err(CaptureError::Aborted)
                }
            }
        }

        async fn speak(&self, text: &str) {
            self.spoken.lock().unwrap().push(text.to_string());
        }

        fn stop_listening(&self) {
            self.stop_listening_calls.fetch_add(1, Ordering::SeqCst);
            self.stopped.notify_one();
        }

        fn stop_speaking(&self) {
            self.stop_speaking_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Greets, answers the silence sentinel with a hint, and echoes anything else.
    fn tutor_transport() -> MockChatTransport {
        let mut transport = MockChatTransport::new();
        transport.expect_complete().returning(|req| {
            Ok(match req.last_learner_text() {
                Some(TIMEOUT_SENTINEL) => HINT.to_string(),
                Some(text) if text.starts_with("Hello teacher!") => GREETING.to_string(),
                Some(text) if text.starts_with("I want to learn words") => {
                    "Cat. Cat. Cat. 🐱".to_string()
                }
                Some(text) => format!("You said {text}!"),
                None => String::new(),
            })
        });
        transport
    }

    fn controller_with(
        transport: MockChatTransport,
        speech: Arc<dyn SpeechCapability>,
    ) -> SessionController {
        let agent = Arc::new(ConversationAgent::new(
            Arc::new(transport),
            RetryPolicy::default(),
        ));
        SessionController::new(agent, speech, DEFAULT_INACTIVITY_TIMEOUT)
    }

    fn texts(controller: &SessionController) -> Vec<String> {
        controller
            .messages()
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }

    async fn step_until(controller: &mut SessionController, turn: TurnState) {
        while controller.turn_state() != turn {
            assert!(controller.step().await, "event queue closed");
        }
    }

    /// Starts an "Animals" conversation and waits for the greeting to be spoken.
    async fn greeted(controller: &mut SessionController) {
        controller
            .start_session("Animals", LearningMode::Conversation)
            .unwrap();
        step_until(controller, TurnState::Speaking).await;
        step_until(controller, TurnState::Idle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_session_greets_then_waits() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());

        controller
            .start_session("Animals", LearningMode::Conversation)
            .unwrap();
        assert_eq!(controller.turn_state(), TurnState::Processing);
        assert!(controller.inactivity_deadline().is_none());

        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Speaking);
        assert_eq!(texts(&controller), vec![GREETING]);
        assert_eq!(controller.messages()[0].role, MessageRole::Tutor);

        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert!(controller.inactivity_deadline().is_some());
        assert_eq!(speech.spoken(), vec![GREETING]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_after_reply_yields_hint_in_order() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;

        controller.handle_user_utterance("I like dogs").unwrap();
        assert_eq!(controller.turn_state(), TurnState::Processing);
        assert!(controller.inactivity_deadline().is_none());
        step_until(&mut controller, TurnState::Speaking).await;
        step_until(&mut controller, TurnState::Idle).await;

        let quiet_since = Instant::now();
        step_until(&mut controller, TurnState::Processing).await;
        assert_eq!(quiet_since.elapsed(), DEFAULT_INACTIVITY_TIMEOUT);
        step_until(&mut controller, TurnState::Speaking).await;
        step_until(&mut controller, TurnState::Idle).await;

        assert_eq!(
            texts(&controller),
            vec![GREETING, "I like dogs", "You said I like dogs!", HINT]
        );
        let roles: Vec<MessageRole> = controller.messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::Tutor,
                MessageRole::Child,
                MessageRole::Tutor,
                MessageRole::Tutor
            ]
        );
        // The hint re-arms the watchdog too.
        assert!(controller.inactivity_deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inputs_rejected_while_processing_or_speaking() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());

        controller
            .start_session("Animals", LearningMode::Conversation)
            .unwrap();
        assert_eq!(
            controller.toggle_recording(),
            Err(ControllerError::Busy(TurnState::Processing))
        );
        assert_eq!(
            controller.handle_user_utterance("hello"),
            Err(ControllerError::Busy(TurnState::Processing))
        );
        assert_eq!(controller.turn_state(), TurnState::Processing);

        controller.step().await;
        assert_eq!(
            controller.toggle_recording(),
            Err(ControllerError::Busy(TurnState::Speaking))
        );
        assert_eq!(controller.turn_state(), TurnState::Speaking);
        assert_eq!(speech.listens.load(Ordering::SeqCst), 0);
        assert_eq!(texts(&controller), vec![GREETING]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_reply_degrades_to_fallback() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_complete()
            .withf(|req| req.last_learner_text() == Some("dog"))
            .times(3)
            .returning(|_| Err(anyhow!("deadline exceeded")));
        transport
            .expect_complete()
            .withf(|req| req.last_learner_text() != Some("dog"))
            .returning(|_| Ok(GREETING.to_string()));
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(transport, speech.clone());
        greeted(&mut controller).await;

        controller.handle_user_utterance("dog").unwrap();
        step_until(&mut controller, TurnState::Speaking).await;
        assert_eq!(texts(&controller), vec![GREETING, "dog", FALLBACK_REPLY]);

        step_until(&mut controller, TurnState::Idle).await;
        assert!(controller.inactivity_deadline().is_some());
        assert_eq!(speech.spoken().last().map(String::as_str), Some(FALLBACK_REPLY));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_listening_stops_capture_first() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;

        controller.toggle_recording().unwrap();
        assert_eq!(controller.turn_state(), TurnState::Listening);
        assert!(controller.inactivity_deadline().is_none());

        controller.on_inactivity_timeout();
        assert_eq!(speech.stop_listening_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.turn_state(), TurnState::Processing);

        // The aborted capture reports back but is ignored.
        step_until(&mut controller, TurnState::Speaking).await;
        step_until(&mut controller, TurnState::Idle).await;
        assert_eq!(texts(&controller), vec![GREETING, HINT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_dispatches_after_settle_delay() {
        let speech = Arc::new(FakeSpeech::hearing(Ok("I like cats".to_string())));
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;

        controller.toggle_recording().unwrap();
        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Listening);
        assert_eq!(speech.stop_listening_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.messages().len(), 1);

        let heard_at = Instant::now();
        controller.step().await;
        assert_eq!(heard_at.elapsed(), CAPTURE_SETTLE_DELAY);
        assert_eq!(controller.turn_state(), TurnState::Processing);

        step_until(&mut controller, TurnState::Speaking).await;
        step_until(&mut controller, TurnState::Idle).await;
        assert_eq!(
            texts(&controller),
            vec![GREETING, "I like cats", "You said I like cats!"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_during_settle_still_sends_utterance() {
        let speech = Arc::new(FakeSpeech::hearing(Ok("I like birds".to_string())));
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;

        controller.toggle_recording().unwrap();
        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Listening);

        controller.toggle_recording().unwrap();
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert!(controller.inactivity_deadline().is_some());
        assert_eq!(speech.stop_listening_calls.load(Ordering::SeqCst), 2);

        let stopped_at = Instant::now();
        controller.step().await;
        assert_eq!(stopped_at.elapsed(), CAPTURE_SETTLE_DELAY);
        assert_eq!(controller.turn_state(), TurnState::Processing);
        assert!(controller.inactivity_deadline().is_none());

        step_until(&mut controller, TurnState::Speaking).await;
        step_until(&mut controller, TurnState::Idle).await;
        assert_eq!(
            texts(&controller),
            vec![GREETING, "I like birds", "You said I like birds!"]
        );
        assert!(controller.inactivity_deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_error_returns_to_idle_with_watchdog() {
        let speech = Arc::new(FakeSpeech::hearing(Err(CaptureError::Recognition(
            "no-speech".to_string(),
        ))));
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;

        controller.toggle_recording().unwrap();
        controller.step().await;

        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert!(controller.inactivity_deadline().is_some());
        assert_eq!(texts(&controller), vec![GREETING]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_capture_returns_to_idle() {
        let speech = Arc::new(FakeSpeech::hearing(Ok("   ".to_string())));
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;

        controller.toggle_recording().unwrap();
        step_until(&mut controller, TurnState::Idle).await;

        assert!(controller.inactivity_deadline().is_some());
        assert_eq!(texts(&controller), vec![GREETING]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_toggle_twice_stops_capture_and_rearms() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;

        controller.toggle_recording().unwrap();
        controller.toggle_recording().unwrap();
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert!(controller.inactivity_deadline().is_some());

        // The stopped capture's completion is dropped.
        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert_eq!(texts(&controller), vec![GREETING]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_unsupported_fails_fast() {
        let mut speech = MockSpeechCapability::new();
        speech.expect_supports_capture().return_const(false);
        speech.expect_listen().never();
        speech.expect_speak().returning(|_| ());
        speech.expect_stop_listening().return_const(());
        speech.expect_stop_speaking().return_const(());
        let mut controller = controller_with(tutor_transport(), Arc::new(speech));
        greeted(&mut controller).await;

        assert_eq!(
            controller.toggle_recording(),
            Err(ControllerError::CaptureUnsupported)
        );
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert!(controller.inactivity_deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_text_is_a_no_op() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech);
        greeted(&mut controller).await;
        let deadline = controller.inactivity_deadline();

        assert_eq!(controller.handle_user_utterance("  \n"), Ok(()));
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert_eq!(controller.inactivity_deadline(), deadline);
        assert_eq!(controller.messages().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_back_then_new_session_starts_fresh() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());
        controller.select_topic("Animals").unwrap();
        controller.select_mode(LearningMode::Conversation).unwrap();
        step_until(&mut controller, TurnState::Speaking).await;
        step_until(&mut controller, TurnState::Idle).await;
        let old_session = controller.session_id();

        tokio::time::advance(Duration::from_secs(5)).await;
        controller.go_back();
        assert_eq!(
            controller.screen(),
            &Screen::ModeSelect {
                topic: "Animals".to_string()
            }
        );
        assert!(controller.messages().is_empty());
        assert!(controller.inactivity_deadline().is_none());
        assert_eq!(controller.session_id(), None);

        controller.select_mode(LearningMode::Vocabulary).unwrap();
        assert_ne!(controller.session_id(), old_session);
        assert!(controller.messages().is_empty());
        step_until(&mut controller, TurnState::Speaking).await;
        step_until(&mut controller, TurnState::Idle).await;
        assert_eq!(texts(&controller), vec!["Cat. Cat. Cat. 🐱"]);

        // Only the new session's watchdog fires, a full interval after its greeting.
        let greeted_at = Instant::now();
        step_until(&mut controller, TurnState::Processing).await;
        assert_eq!(greeted_at.elapsed(), DEFAULT_INACTIVITY_TIMEOUT);
        step_until(&mut controller, TurnState::Idle).await;
        assert_eq!(texts(&controller), vec!["Cat. Cat. Cat. 🐱", HINT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_back_while_speaking_silences_tutor() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());
        controller
            .start_session("Animals", LearningMode::Conversation)
            .unwrap();
        step_until(&mut controller, TurnState::Speaking).await;

        controller.go_back();
        assert_eq!(speech.stop_speaking_calls.load(Ordering::SeqCst), 1);
        assert_eq!(controller.turn_state(), TurnState::Idle);

        // The cut-off speech still reports back, to a session that is gone.
        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert!(controller.inactivity_deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_go_back_while_listening_stops_capture() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech.clone());
        greeted(&mut controller).await;
        controller.toggle_recording().unwrap();

        controller.go_back();
        assert_eq!(speech.stop_listening_calls.load(Ordering::SeqCst), 1);

        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Idle);
        assert!(controller.messages().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_greeting_for_abandoned_session_is_dropped() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech);

        controller
            .start_session("Animals", LearningMode::Conversation)
            .unwrap();
        controller.go_back();
        controller.select_mode(LearningMode::Vocabulary).unwrap();

        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Processing);
        assert!(controller.messages().is_empty());

        controller.step().await;
        assert_eq!(controller.turn_state(), TurnState::Speaking);
        assert_eq!(texts(&controller), vec!["Cat. Cat. Cat. 🐱"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_navigation_between_screens() {
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech);
        assert_eq!(controller.screen(), &Screen::Landing);
        assert_eq!(
            controller.handle_user_utterance("hi"),
            Err(ControllerError::NoSession)
        );

        controller.apply(UiInput::OpenTopics).unwrap();
        assert_eq!(controller.screen(), &Screen::TopicSelect);
        assert_eq!(
            controller.apply(UiInput::SelectTopic("   ".to_string())),
            Err(ControllerError::NoTopic)
        );
        assert_eq!(
            controller.apply(UiInput::SelectMode(LearningMode::Vocabulary)),
            Err(ControllerError::NoTopic)
        );

        controller
            .apply(UiInput::SelectTopic("Space".to_string()))
            .unwrap();
        controller.apply(UiInput::Back).unwrap();
        assert_eq!(controller.screen(), &Screen::TopicSelect);
        controller.apply(UiInput::Back).unwrap();
        assert_eq!(controller.screen(), &Screen::TopicSelect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_follow_the_turn() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let speech = Arc::new(FakeSpeech::default());
        let mut controller = controller_with(tutor_transport(), speech).with_updates(tx);

        controller
            .start_session("Animals", LearningMode::Conversation)
            .unwrap();
        controller.step().await;
        controller.step().await;

        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        assert_eq!(
            updates[0],
            Update::Screen(Screen::Chat {
                topic: "Animals".to_string(),
                mode: LearningMode::Conversation
            })
        );
        assert_eq!(updates[1], Update::Turn(TurnState::Processing));
        assert!(matches!(&updates[2], Update::Appended(m) if m.text == GREETING));
        assert_eq!(updates[3], Update::Turn(TurnState::Speaking));
        assert_eq!(updates[4], Update::Turn(TurnState::Idle));
        assert_eq!(updates.len(), 5);
    }
}
