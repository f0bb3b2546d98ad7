//! # Speech Input Pipeline
//!
//! Turn-taking on the user side: owns the recognizer handle, stages partial
//! transcripts as a live draft, and decides when a final transcript becomes a
//! query.
//!
//! ## Microphone flags:
//! - `listening`: the recognizer confirmed it is running
//! - `input_enabled`: no start/stop is in flight; the microphone control may be used
//!
//! Start and stop are asynchronous. `begin_*` flips `input_enabled` off and
//! hands back the recognizer for the orchestrator to drive; `finish_*` is fed
//! the result and turns it back on. A stop wanted while a start is still in
//! flight is remembered and handed out by `finish_start`.

use crate::session::collaborators::RecognizerHandle;
use crate::session::error::{SessionError, SessionResult};
use crate::session::model::MicrophoneSnapshot;
use std::time::Instant;

/// Latest partial recognition text of the current turn.
#[derive(Debug, Clone)]
pub struct TranscriptDraft {
    pub text: String,
    pub updated_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationMode {
    /// Stop listening after one final result.
    SingleTurn,
    /// Keep listening after dispatching a result.
    Continuous,
}

impl ConversationMode {
    pub fn from_flag(continuous: bool) -> Self {
        if continuous {
            ConversationMode::Continuous
        } else {
            ConversationMode::SingleTurn
        }
    }
}

/// Result of a final recognition event.
pub enum FinalOutcome {
    /// Blank transcript, nothing to do.
    Ignored,
    /// Dispatch `query`; if `stop` is set the recognizer must be stopped.
    Dispatch {
        query: String,
        stop: Option<RecognizerHandle>,
    },
}

pub struct SpeechInputPipeline {
    recognizer: Option<RecognizerHandle>,
    draft: Option<TranscriptDraft>,
    listening: bool,
    input_enabled: bool,
    deferred_start: bool,
    starting: bool,
    stop_after_start: bool,
}

impl Default for SpeechInputPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechInputPipeline {
    pub fn new() -> Self {
        Self {
            recognizer: None,
            draft: None,
            listening: false,
            input_enabled: false,
            deferred_start: false,
            starting: false,
            stop_after_start: false,
        }
    }

    pub fn attach(&mut self, recognizer: RecognizerHandle) {
        self.recognizer = Some(recognizer);
        self.listening = false;
        self.input_enabled = true;
    }

    /// Hand the recognizer back for release. Returns it with its listening flag.
    pub fn detach(&mut self) -> Option<(RecognizerHandle, bool)> {
        let was_listening = self.listening;
        self.listening = false;
        self.input_enabled = false;
        self.recognizer.take().map(|r| (r, was_listening))
    }

    pub fn has_recognizer(&self) -> bool {
        self.recognizer.is_some()
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn input_enabled(&self) -> bool {
        self.input_enabled
    }

    /// Claim the microphone for a start.
    ///
    /// `Ok(None)` means it is already listening.
    pub fn begin_start(&mut self) -> SessionResult<Option<RecognizerHandle>> {
        let recognizer = self
            .recognizer
            .clone()
            .ok_or_else(|| SessionError::Recognition("no recognizer attached".to_string()))?;
        if self.listening {
            return Ok(None);
        }
        if !self.input_enabled {
            return Err(SessionError::Recognition(
                "microphone is busy".to_string(),
            ));
        }
        self.input_enabled = false;
        self.starting = true;
        Ok(Some(recognizer))
    }

    /// Apply the start result. Returns the recognizer when a stop was
    /// requested while the start was in flight; the caller must stop it.
    pub fn finish_start(&mut self, result: &SessionResult<()>) -> Option<RecognizerHandle> {
        self.starting = false;
        self.input_enabled = true;
        let stop_wanted = std::mem::take(&mut self.stop_after_start);
        if result.is_err() {
            return None;
        }
        self.listening = true;
        if stop_wanted {
            self.begin_stop()
        } else {
            None
        }
    }

    /// Ask for a stop once the in-flight start lands. False when no start is pending.
    pub fn stop_once_started(&mut self) -> bool {
        if self.starting {
            self.stop_after_start = true;
        }
        self.starting
    }

    /// Claim the microphone for a stop. `None` when there is nothing to stop.
    pub fn begin_stop(&mut self) -> Option<RecognizerHandle> {
        if !self.listening || !self.input_enabled {
            return None;
        }
        self.input_enabled = false;
        self.recognizer.clone()
    }

    pub fn finish_stop(&mut self, result: &SessionResult<()>) {
        self.input_enabled = true;
        if result.is_ok() {
            self.listening = false;
        }
    }

    /// Replace the draft with the newest partial. Never dispatches anything.
    pub fn on_partial(&mut self, text: &str) -> &str {
        let draft = self.draft.insert(TranscriptDraft {
            text: text.to_string(),
            updated_at: Instant::now(),
        });
        &draft.text
    }

    /// Promote a final transcript to a query.
    pub fn on_final(&mut self, text: &str, mode: ConversationMode) -> FinalOutcome {
        self.draft = None;
        let query = text.trim();
        if query.is_empty() {
            return FinalOutcome::Ignored;
        }
        let stop = match mode {
            ConversationMode::SingleTurn => {
                let stop = self.begin_stop();
                if stop.is_none() {
                    self.stop_once_started();
                }
                stop
            }
            ConversationMode::Continuous => None,
        };
        FinalOutcome::Dispatch {
            query: query.to_string(),
            stop,
        }
    }

    /// The recognizer stopped by itself.
    pub fn on_canceled(&mut self) {
        self.draft = None;
        self.listening = false;
        if self.recognizer.is_some() {
            self.input_enabled = true;
        }
    }

    pub fn abort_turn(&mut self) {
        self.draft = None;
    }

    pub fn draft(&self) -> Option<&str> {
        self.draft.as_ref().map(|d| d.text.as_str())
    }

    /// Remember a start requested while the transport is unavailable.
    pub fn defer_start(&mut self) {
        self.deferred_start = true;
    }

    pub fn is_start_deferred(&self) -> bool {
        self.deferred_start
    }

    /// Consume the deferred start, if any.
    pub fn take_deferred_start(&mut self) -> bool {
        std::mem::take(&mut self.deferred_start)
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn snapshot(&self) -> MicrophoneSnapshot {
        MicrophoneSnapshot {
            listening: self.listening,
            input_enabled: self.input_enabled,
            start_deferred: self.deferred_start,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FakeRecognizer;
    use std::sync::Arc;

    fn attached() -> SpeechInputPipeline {
        let mut pipeline = SpeechInputPipeline::new();
        pipeline.attach(Arc::new(FakeRecognizer::default()));
        pipeline
    }

    fn listening() -> SpeechInputPipeline {
        let mut pipeline = attached();
        pipeline.begin_start().unwrap();
        pipeline.finish_start(&Ok(()));
        pipeline
    }

    #[test]
    fn test_start_requires_recognizer() {
        let mut pipeline = SpeechInputPipeline::new();
        assert!(pipeline.begin_start().is_err());
    }

    #[test]
    fn test_start_disables_input_until_confirmed() {
        let mut pipeline = attached();
        assert!(pipeline.begin_start().unwrap().is_some());
        assert!(!pipeline.input_enabled());
        // A second press while the first is in flight is rejected.
        assert!(pipeline.begin_start().is_err());

        pipeline.finish_start(&Ok(()));
        assert!(pipeline.is_listening());
        assert!(pipeline.input_enabled());
        assert!(pipeline.begin_start().unwrap().is_none());
    }

    #[test]
    fn test_failed_start_reenables_input() {
        let mut pipeline = attached();
        pipeline.begin_start().unwrap();
        pipeline.finish_start(&Err(SessionError::Recognition("no device".into())));
        assert!(!pipeline.is_listening());
        assert!(pipeline.input_enabled());
    }

    #[test]
    fn test_partials_only_update_draft() {
        let mut pipeline = listening();
        assert_eq!(pipeline.on_partial("Hel"), "Hel");
        assert_eq!(pipeline.on_partial("Hello"), "Hello");
        assert_eq!(pipeline.draft(), Some("Hello"));
        assert!(pipeline.is_listening());
    }

    #[test]
    fn test_single_turn_final_dispatches_and_stops() {
        let mut pipeline = listening();
        pipeline.on_partial("Hello");

        match pipeline.on_final("  Hello there ", ConversationMode::SingleTurn) {
            FinalOutcome::Dispatch { query, stop } => {
                assert_eq!(query, "Hello there");
                assert!(stop.is_some());
            }
            FinalOutcome::Ignored => panic!("final transcript was ignored"),
        }
        assert!(pipeline.draft().is_none());
        assert!(!pipeline.input_enabled());

        pipeline.finish_stop(&Ok(()));
        assert!(!pipeline.is_listening());
        assert!(pipeline.input_enabled());
    }

    #[test]
    fn test_continuous_final_keeps_listening() {
        let mut pipeline = listening();
        match pipeline.on_final("next question", ConversationMode::Continuous) {
            FinalOutcome::Dispatch { stop, .. } => assert!(stop.is_none()),
            FinalOutcome::Ignored => panic!("final transcript was ignored"),
        }
        assert!(pipeline.is_listening());
        assert!(pipeline.input_enabled());
    }

    #[test]
    fn test_blank_final_is_ignored() {
        let mut pipeline = listening();
        pipeline.on_partial("uh");
        assert!(matches!(
            pipeline.on_final("   ", ConversationMode::SingleTurn),
            FinalOutcome::Ignored
        ));
        assert!(pipeline.draft().is_none());
        assert!(pipeline.is_listening());
    }

    #[test]
    fn test_final_during_start_stops_once_started() {
        let mut pipeline = attached();
        pipeline.begin_start().unwrap();

        match pipeline.on_final("Hello there", ConversationMode::SingleTurn) {
            FinalOutcome::Dispatch { query, stop } => {
                assert_eq!(query, "Hello there");
                assert!(stop.is_none());
            }
            FinalOutcome::Ignored => panic!("final transcript was ignored"),
        }

        assert!(pipeline.finish_start(&Ok(())).is_some());
        assert!(pipeline.is_listening());
        assert!(!pipeline.input_enabled());

        pipeline.finish_stop(&Ok(()));
        assert!(!pipeline.is_listening());
        assert!(pipeline.input_enabled());
    }

    #[test]
    fn test_failed_start_drops_pending_stop() {
        let mut pipeline = attached();
        pipeline.begin_start().unwrap();
        assert!(pipeline.stop_once_started());
        assert!(pipeline
            .finish_start(&Err(SessionError::Recognition("no device".into())))
            .is_none());
        assert!(!pipeline.is_listening());

        pipeline.begin_start().unwrap();
        assert!(pipeline.finish_start(&Ok(())).is_none());
    }

    #[test]
    fn test_deferred_start_is_consumed_once() {
        let mut pipeline = attached();
        pipeline.defer_start();
        assert!(pipeline.snapshot().start_deferred);
        assert!(pipeline.take_deferred_start());
        assert!(!pipeline.take_deferred_start());
    }
}
