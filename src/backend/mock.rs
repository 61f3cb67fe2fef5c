//! Scripted backend for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::{InferenceBackend, InferenceError, PromptContext};

/// One scripted reaction to an inference call.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Return this completion text.
    Respond(String),
    /// Fail with this error.
    Fail(InferenceError),
    /// Never resolve; the caller's timeout or cancellation must fire.
    Hang,
}

/// Backend that plays back a scripted sequence of responses, then falls
/// through to an optional repeating response. Counts calls so tests can
/// assert how many inference rounds actually ran.
pub struct ScriptedBackend {
    script: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<String>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Backend that answers every call with the same completion.
    pub fn always(response: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(response.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn then_respond(self, response: &str) -> Self {
        self.push(ScriptStep::Respond(response.to_string()))
    }

    pub fn then_fail(self, error: InferenceError) -> Self {
        self.push(ScriptStep::Fail(error))
    }

    pub fn then_hang(self) -> Self {
        self.push(ScriptStep::Hang)
    }

    /// After the script runs out, keep answering with this completion.
    pub fn finally(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    fn push(self, step: ScriptStep) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(step);
        }
        self
    }

    /// Number of inference calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn infer(&self, _prompt: &PromptContext) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());
        match step {
            Some(ScriptStep::Respond(text)) => Ok(text),
            Some(ScriptStep::Fail(error)) => Err(error),
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => match &self.fallback {
                Some(text) => Ok(text.clone()),
                None => Err(InferenceError::BackendUnavailable(
                    "scripted backend exhausted".into(),
                )),
            },
        }
    }

    async fn healthy(&self) -> Result<(), InferenceError> {
        Ok(())
    }
}
