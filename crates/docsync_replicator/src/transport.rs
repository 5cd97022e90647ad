//! Request-issuing capability.
//!
//! A [`Transport`] takes a request and reports its outcome through a
//! completion callback, on whatever thread it likes. The session marshals
//! every completion back onto its scheduler before touching state.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use url::Url;

/// HTTP methods used by the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
        })
    }
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRequest {
    /// Method.
    pub method: Method,
    /// Absolute URL.
    pub url: String,
    /// JSON body, if any.
    pub body: Option<Value>,
    /// Extra headers.
    pub headers: Vec<(String, String)>,
}

impl RemoteRequest {
    /// Creates a request without body or headers.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    /// Sets the body.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Sets the headers.
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Path component of the URL, without query or fragment.
    pub fn path(&self) -> String {
        url_path(&self.url)
    }
}

/// Receives the outcome of a request.
pub type Completion = Box<dyn FnOnce(ReplicationResult<Value>) + Send + 'static>;

/// Issues requests asynchronously.
pub trait Transport: Send + Sync {
    /// Sends `request`. `completion` is called exactly once, possibly on
    /// another thread, possibly before this returns.
    fn send(&self, request: RemoteRequest, completion: Completion);
}

/// Path of a URL, without query or fragment. Relative references are
/// resolved against the server root.
pub(crate) fn url_path(url: &str) -> String {
    Url::parse(url)
        .or_else(|_| Url::parse("http://localhost/").and_then(|root| root.join(url)))
        .map(|parsed| parsed.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[derive(Default)]
struct MockState {
    sticky: HashMap<(Method, String), ReplicationResult<Value>>,
    once: HashMap<(Method, String), VecDeque<ReplicationResult<Value>>>,
    requests: Vec<RemoteRequest>,
    held: VecDeque<(RemoteRequest, Completion)>,
    deferred: bool,
    unreachable: bool,
}

impl MockState {
    fn response_for(&mut self, request: &RemoteRequest) -> ReplicationResult<Value> {
        if self.unreachable {
            return Err(ReplicationError::transport_retryable("connection refused"));
        }
        let key = (request.method, request.path());
        if let Some(result) = self.once.get_mut(&key).and_then(VecDeque::pop_front) {
            return result;
        }
        self.sticky
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Err(ReplicationError::http(404, "not_found")))
    }
}

/// A scripted transport for testing.
///
/// Responses are keyed by method and URL path; anything unscripted answers
/// 404. In deferred mode completions are held until released, which lets
/// tests observe the session with requests outstanding.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    /// Creates a transport with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers every `method` request to `path` with `result`.
    pub fn respond(&self, method: Method, path: &str, result: ReplicationResult<Value>) {
        self.state
            .lock()
            .sticky
            .insert((method, path.to_string()), result);
    }

    /// Answers the next `method` request to `path` with `result`, ahead of
    /// any sticky response.
    pub fn respond_once(&self, method: Method, path: &str, result: ReplicationResult<Value>) {
        self.state
            .lock()
            .once
            .entry((method, path.to_string()))
            .or_default()
            .push_back(result);
    }

    /// Holds completions until released.
    pub fn set_deferred(&self, deferred: bool) {
        self.state.lock().deferred = deferred;
    }

    /// Makes every request fail with a connectivity error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Number of held completions.
    pub fn held(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Completes the oldest held request. Returns false if none was held.
    pub fn release_next(&self) -> bool {
        let next = {
            let mut state = self.state.lock();
            match state.held.pop_front() {
                Some((request, completion)) => {
                    let result = state.response_for(&request);
                    Some((completion, result))
                }
                None => None,
            }
        };
        match next {
            Some((completion, result)) => {
                completion(result);
                true
            }
            None => false,
        }
    }

    /// Completes every held request, including ones issued meanwhile.
    pub fn release_all(&self) -> usize {
        let mut released = 0;
        while self.release_next() {
            released += 1;
        }
        released
    }

    /// All requests sent so far.
    pub fn requests(&self) -> Vec<RemoteRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests sent with `method` to `path`.
    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RemoteRequest> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path() == path)
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, request: RemoteRequest, completion: Completion) {
        let ready = {
            let mut state = self.state.lock();
            state.requests.push(request.clone());
            if state.deferred {
                state.held.push_back((request, completion));
                None
            } else {
                let result = state.response_for(&request);
                Some((completion, result))
            }
        };
        if let Some((completion, result)) = ready {
            completion(result);
        }
    }
}
