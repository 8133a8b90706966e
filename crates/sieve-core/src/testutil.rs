//! Test utilities: handwritten mocks of the core traits.
//!
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use url::Url;

use crate::error::AppError;
use crate::traits::{CandidateSelector, FetchRequest, Fetcher, SelectorSuggester};

type FetchHook = Arc<dyn Fn(usize) + Send + Sync>;

enum Response {
    Body(String),
    Fail(String),
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher serving fixed bodies per URL.
///
/// Unknown URLs answer with an HTTP 404 error. Every request is recorded.
#[derive(Clone, Default)]
pub struct MockFetcher {
    pages: Arc<Mutex<HashMap<String, Response>>>,
    calls: Arc<Mutex<Vec<FetchRequest>>>,
    hook: Option<FetchHook>,
}

fn key(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, body: impl Into<String>) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(key(url), Response::Body(body.into()));
        self
    }

    /// Every fetch of `url` fails with an HTTP error.
    pub fn with_failure(self, url: &str, message: impl Into<String>) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(key(url), Response::Fail(message.into()));
        self
    }

    /// Run `hook(n)` after the n-th fetch (1-based) completes.
    pub fn with_hook(mut self, hook: impl Fn(usize) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fetched_urls(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| key(&c.url)).collect()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len()
        };
        let result = match self.pages.lock().unwrap().get(&key(&request.url)) {
            Some(Response::Body(body)) => Ok(body.clone()),
            Some(Response::Fail(message)) => Err(AppError::HttpError(message.clone())),
            None => Err(AppError::HttpError(format!("HTTP 404 for {}", request.url))),
        };
        if let Some(hook) = &self.hook {
            hook(count);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// MockSuggester
// ---------------------------------------------------------------------------

/// Suggester returning a fixed candidate list for any page.
#[derive(Clone)]
pub struct MockSuggester {
    candidates: Arc<Vec<CandidateSelector>>,
    pages: Arc<Mutex<Vec<String>>>,
}

impl MockSuggester {
    pub fn new(candidates: Vec<CandidateSelector>) -> Self {
        Self {
            candidates: Arc::new(candidates),
            pages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn analyzed_pages(&self) -> Vec<String> {
        self.pages.lock().unwrap().clone()
    }
}

impl SelectorSuggester for MockSuggester {
    async fn analyze_page(&self, url: &str) -> Result<Vec<CandidateSelector>, AppError> {
        self.pages.lock().unwrap().push(url.to_string());
        Ok(self.candidates.as_ref().clone())
    }
}
