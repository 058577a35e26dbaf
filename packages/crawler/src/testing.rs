//! Test doubles for the crawl side.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use url::Url;

use crate::error::FetchError;
use crate::fetcher::{FetchedPage, PageFetcher};

/// Scripted response for one URL.
enum MockResponse {
    Page { html: String, final_url: Option<String> },
    Error(fn(&Url) -> FetchError),
}

/// PageFetcher double serving canned pages; unknown URLs 404.
#[derive(Default)]
pub struct MockFetcher {
    responses: Mutex<HashMap<String, MockResponse>>,
    fetched: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, html: &str) -> Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            MockResponse::Page {
                html: html.to_string(),
                final_url: None,
            },
        );
        self
    }

    /// A page that redirects: fetching `url` lands on `final_url`.
    pub fn with_redirected_page(self, url: &str, final_url: &str, html: &str) -> Self {
        self.responses.lock().unwrap().insert(
            url.to_string(),
            MockResponse::Page {
                html: html.to_string(),
                final_url: Some(final_url.to_string()),
            },
        );
        self
    }

    pub fn with_error(self, url: &str, error: fn(&Url) -> FetchError) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert(url.to_string(), MockResponse::Error(error));
        self
    }

    /// URLs fetched, in order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for MockFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        let responses = self.responses.lock().unwrap();
        match responses.get(url.as_str()) {
            Some(MockResponse::Page { html, final_url }) => {
                let final_url = match final_url {
                    Some(f) => Url::parse(f).expect("mock final url must parse"),
                    None => url.clone(),
                };
                Ok(FetchedPage {
                    requested_url: url.clone(),
                    final_url,
                    status: 200,
                    html: html.clone(),
                    fetched_at: Utc::now(),
                })
            }
            Some(MockResponse::Error(make)) => Err(make(url)),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }
}
