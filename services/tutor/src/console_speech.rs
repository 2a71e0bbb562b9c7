//! A speech capability for terminals: no recognizer, and synthesis that only
//! takes as long as reading the text aloud would.

use async_trait::async_trait;
use std::time::Duration;
use talkers_core::speech::{CaptureError, SpeechCapability, VoiceProfile, speakable_text};
use tokio::sync::Notify;
use tracing::debug;

/// Words per second at a rate of 1.0.
const WORDS_PER_SECOND: f32 = 2.5;

pub struct ConsoleSpeech {
    voice: VoiceProfile,
    cancel: Notify,
}

impl ConsoleSpeech {
    pub fn new(voice: VoiceProfile) -> Self {
        Self {
            voice,
            cancel: Notify::new(),
        }
    }

    /// How long `text` takes to say with this voice.
    pub fn speaking_time(&self, text: &str) -> Duration {
        let words = text.split_whitespace().count() as f32;
        Duration::from_secs_f32(words / (WORDS_PER_SECOND * self.voice.rate))
    }
}

#[async_trait]
impl SpeechCapability for ConsoleSpeech {
    fn supports_capture(&self) -> bool {
        false
    }

    async fn listen(&self) -> Result<String, CaptureError> {
        Err(CaptureError::Unsupported)
    }

    async fn speak(&self, text: &str) {
        // Cut off whatever is still playing.
        self.cancel.notify_waiters();

        let text = speakable_text(text);
        if text.is_empty() {
            return;
        }
        let duration = self.speaking_time(&text);
        debug!(%text, pitch = self.voice.pitch, rate = self.voice.rate, ?duration, "Speaking");

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.notified() => debug!("Speech cancelled"),
        }
    }

    fn stop_listening(&self) {}

    fn stop_speaking(&self) {
        self.cancel.notify_waiters();
    }
}
