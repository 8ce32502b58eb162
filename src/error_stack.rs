use kafka_protocol::{error::ResponseError, messages::ApiKey};
use std::collections::VecDeque;
use std::sync::Mutex;

/// A stack of error codes handed out, one per request, for requests whose
/// ApiKey matches the stack's scope.
struct ErrorStack {
    /// ApiKey this stack applies to, or `None` for any key.
    api_key: Option<i16>,
    errs: VecDeque<i16>,
}

/// Store of injected request errors.
///
/// This is the only piece of cluster state mutated from outside the cluster
/// thread: control-plane callers push stacks, the dispatcher pops codes.
/// The interior mutex covers exactly this store and nothing else.
pub struct ErrorStacks {
    stacks: Mutex<Vec<ErrorStack>>,
}

impl ErrorStacks {
    pub fn new() -> Self {
        Self {
            stacks: Mutex::new(Vec::new()),
        }
    }

    /// Append a stack of errors to return for the next `errors.len()`
    /// requests matching `api_key` (`None` matches any request).
    pub fn push(&self, api_key: Option<ApiKey>, errors: &[ResponseError]) {
        let mut stacks = self.stacks.lock().unwrap();
        stacks.push(ErrorStack {
            api_key: api_key.map(|k| k as i16),
            errs: errors.iter().map(|e| e.code()).collect(),
        });
    }

    /// Pop the next injected error code for a request with `api_key`.
    ///
    /// Stacks are consulted in insertion order; the first whose scope matches
    /// (exact key or wildcard) yields its head error. Depleted stacks are
    /// removed.
    pub fn next(&self, api_key: i16) -> Option<i16> {
        let mut stacks = self.stacks.lock().unwrap();
        let idx = stacks
            .iter()
            .position(|s| s.api_key.map_or(true, |k| k == api_key))?;

        let code = stacks[idx].errs.pop_front();
        if stacks[idx].errs.is_empty() {
            stacks.remove(idx);
        }
        code
    }
}

impl Default for ErrorStacks {
    fn default() -> Self {
        Self::new()
    }
}
