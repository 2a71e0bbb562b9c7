//! Speech capture and synthesis contract.
//!
//! Concrete engines live outside this crate. The controller only relies on
//! the guarantees documented on [`SpeechCapability`].

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Why a capture ended without a transcript.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("speech recognition is not supported on this platform")]
    Unsupported,
    #[error("speech recognition failed: {0}")]
    Recognition(String),
    #[error("capture stopped before any speech was heard")]
    Aborted,
}

/// Pitch and rate bias applied to every synthesized utterance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceProfile {
    pub pitch: f32,
    pub rate: f32,
}

impl VoiceProfile {
    /// Slightly higher and slower than a neutral voice.
    pub const CHILD_FRIENDLY: VoiceProfile = VoiceProfile {
        pitch: 1.1,
        rate: 0.85,
    };
}

impl Default for VoiceProfile {
    fn default() -> Self {
        Self::CHILD_FRIENDLY
    }
}

/// Capture one utterance, or synthesize one.
///
/// `listen` resolves exactly once per call, with the transcript or an error.
/// `speak` resolves once playback has ended or was cancelled; a synthesis
/// already in flight is cancelled rather than queued. Both `stop_*` methods
/// are best-effort and do nothing when nothing is active.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SpeechCapability: Send + Sync {
    /// Whether this platform has a recognizer at all.
    fn supports_capture(&self) -> bool;

    async fn listen(&self) -> Result<String, CaptureError>;

    async fn speak(&self, text: &str);

    fn stop_listening(&self);

    fn stop_speaking(&self);
}

/// Removes pictographs and dingbats that synthesizers read out as noise.
pub fn speakable_text(text: &str) -> String {
    let kept: String = text.chars().filter(|c| !is_pictograph(*c)).collect();
    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_pictograph(c: char) -> bool {
    matches!(
        c as u32,
        0x2011..=0x26FF      // punctuation, arrows, technical and misc symbols
            | 0x2700..=0x27BF // dingbats
            | 0xE000..=0xF8FF // private use
            | 0xFE0F          // emoji presentation selector
            | 0x200D          // zero width joiner
            | 0x1F000..=0x1FAFF
    )
}
