//! Scripted [`Completion`] for tests: answers queued per [`Purpose`], with
//! every request recorded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{Completion, CompletionRequest, OracleError, Purpose};

#[derive(Default)]
pub struct ScriptedCompletion {
    answers: Mutex<HashMap<Purpose, VecDeque<Result<String, OracleError>>>>,
    defaults: Mutex<HashMap<Purpose, String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one answer for `purpose`.
    pub fn push(&self, purpose: Purpose, answer: impl Into<String>) -> &Self {
        lock(&self.answers).entry(purpose).or_default().push_back(Ok(answer.into()));
        self
    }

    pub fn push_err(&self, purpose: Purpose, err: OracleError) -> &Self {
        lock(&self.answers).entry(purpose).or_default().push_back(Err(err));
        self
    }

    /// Answer used whenever the queue for `purpose` is empty.
    pub fn always(&self, purpose: Purpose, answer: impl Into<String>) -> &Self {
        lock(&self.defaults).insert(purpose, answer.into());
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        lock(&self.requests).clone()
    }

    pub fn calls(&self, purpose: Purpose) -> usize {
        lock(&self.requests).iter().filter(|r| r.purpose == purpose).count()
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl Completion for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, OracleError> {
        lock(&self.requests).push(request.clone());
        let queued = lock(&self.answers).get_mut(&request.purpose).and_then(|q| q.pop_front());
        if let Some(answer) = queued {
            return answer;
        }
        lock(&self.defaults)
            .get(&request.purpose)
            .cloned()
            .ok_or_else(|| OracleError::Http(format!("no scripted answer for {:?}", request.purpose)))
    }
}
