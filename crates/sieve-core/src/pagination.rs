//! Pagination state machine.
//!
//! One [`PaginationController`] walks one source URL. After every page the
//! orchestrator reports what it saw as [`PageSignals`] and the controller
//! answers with the next URL or a stop reason. Stop conditions are checked
//! first in fixed priority order, then the `maxPages` ceiling, then the
//! pagination type produces a target. A target that cannot be computed is a
//! stop, never an error.

use std::collections::HashSet;
use std::fmt;

use url::Url;

use crate::error::AppError;
use crate::extract::PageLink;
use crate::schema::{PAGE_PLACEHOLDER, PaginationConfig, PaginationType, StopCondition};

/// Why pagination ended for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The schema has no pagination.
    NotPaginated,
    MaxPages,
    MaxItems,
    NoResults,
    DuplicateData,
    SelectorMissing,
    /// The next control is gone from the page.
    EndOfResults,
    /// No usable next URL could be computed.
    NoNextTarget,
    /// The page failed to load and this pagination type cannot skip it.
    FetchFailed,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::NotPaginated => "not_paginated",
            StopReason::MaxPages => "max_pages",
            StopReason::MaxItems => "max_items",
            StopReason::NoResults => "no_results",
            StopReason::DuplicateData => "duplicate_data",
            StopReason::SelectorMissing => "selector_missing",
            StopReason::EndOfResults => "end_of_results",
            StopReason::NoNextTarget => "no_next_target",
            StopReason::FetchFailed => "fetch_failed",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextOrStop {
    Next(String),
    Stop(StopReason),
}

/// Observations about the page just processed.
#[derive(Debug, Clone, Default)]
pub struct PageSignals {
    pub items_on_page: usize,
    /// Items extracted by the whole job so far.
    pub items_extracted_total: u64,
    /// Canonical signature of the page's item set; `None` when unknown.
    pub page_signature: Option<String>,
    pub links: Vec<PageLink>,
    pub next_present: bool,
    pub stop_selector_missing: bool,
    pub fetch_failed: bool,
}

#[derive(Debug, Clone)]
pub struct PaginationController {
    source_url: String,
    current_page: u32,
    max_pages: u32,
    visited_signatures: HashSet<String>,
    visited_urls: HashSet<String>,
}

impl PaginationController {
    /// Start at page 1 of `source_url`. `default_max_pages` applies when the
    /// config has no `maxPages`.
    pub fn new(source_url: &str, config: &PaginationConfig, default_max_pages: u32) -> Self {
        let max_pages = match config.kind {
            PaginationType::None => 1,
            _ => config.max_pages.unwrap_or(default_max_pages).max(1),
        };
        let first = first_page_url(source_url);
        let first = Url::parse(&first).map(|u| u.to_string()).unwrap_or(first);
        Self {
            source_url: source_url.to_string(),
            current_page: 1,
            max_pages,
            visited_signatures: HashSet::new(),
            visited_urls: HashSet::from([first]),
        }
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    /// Page ceiling for this source.
    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    /// Decide what follows the page just processed.
    pub fn next(&mut self, config: &PaginationConfig, signals: &PageSignals) -> NextOrStop {
        let duplicate = signals
            .page_signature
            .as_ref()
            .is_some_and(|sig| !self.visited_signatures.insert(sig.clone()));

        if let Some(reason) = stop_condition_hit(config, signals, duplicate) {
            return NextOrStop::Stop(reason);
        }
        if config.kind == PaginationType::None {
            return NextOrStop::Stop(StopReason::NotPaginated);
        }
        if self.current_page >= self.max_pages {
            return NextOrStop::Stop(StopReason::MaxPages);
        }
        if signals.fetch_failed && config.kind != PaginationType::UrlPattern {
            return NextOrStop::Stop(StopReason::FetchFailed);
        }

        match self.target(config, signals) {
            Ok(Some(url)) => {
                if !self.visited_urls.insert(url.clone()) {
                    tracing::debug!(%url, "Next page already visited");
                    return NextOrStop::Stop(StopReason::NoNextTarget);
                }
                self.current_page += 1;
                NextOrStop::Next(url)
            }
            Ok(None) => NextOrStop::Stop(
                if matches!(
                    config.kind,
                    PaginationType::NextButton | PaginationType::LoadMore
                ) && !signals.next_present
                {
                    StopReason::EndOfResults
                } else {
                    StopReason::NoNextTarget
                },
            ),
            Err(e) => {
                tracing::warn!(error = %e, page = self.current_page, "Stopping pagination");
                NextOrStop::Stop(StopReason::NoNextTarget)
            }
        }
    }

    fn target(
        &self,
        config: &PaginationConfig,
        signals: &PageSignals,
    ) -> Result<Option<String>, AppError> {
        let next_page = self.current_page + 1;
        let first_link = || signals.links.first().map(|l| l.href.clone());

        match config.kind {
            PaginationType::None => Ok(None),
            PaginationType::UrlPattern => self.pattern_url(config, next_page),
            PaginationType::NextButton => {
                if !signals.next_present {
                    return Ok(None);
                }
                Ok(first_link())
            }
            PaginationType::LoadMore => {
                if !signals.next_present {
                    return Ok(None);
                }
                match first_link() {
                    Some(url) => Ok(Some(url)),
                    None => self.pattern_url(config, next_page),
                }
            }
            PaginationType::PageNumbers => {
                let label = next_page.to_string();
                if let Some(link) = signals.links.iter().find(|l| l.label.trim() == label) {
                    return Ok(Some(link.href.clone()));
                }
                self.pattern_url(config, next_page)
            }
            PaginationType::InfiniteScroll => match self.pattern_url(config, next_page)? {
                Some(url) => Ok(Some(url)),
                None => Ok(first_link()),
            },
        }
    }

    /// `urlPattern`, or the source URL itself when it carries `{page}`.
    fn pattern_url(
        &self,
        config: &PaginationConfig,
        page: u32,
    ) -> Result<Option<String>, AppError> {
        let pattern = match &config.url_pattern {
            Some(p) => p.as_str(),
            None if self.source_url.contains(PAGE_PLACEHOLDER) => self.source_url.as_str(),
            None => return Ok(None),
        };
        let candidate = pattern.replace(PAGE_PLACEHOLDER, &page.to_string());
        Url::parse(&candidate)
            .map(|u| Some(u.to_string()))
            .map_err(|e| AppError::Pagination(format!("bad page URL '{candidate}': {e}")))
    }
}

/// First URL fetched for a source: `{page}` becomes 1.
pub fn first_page_url(source_url: &str) -> String {
    source_url.replace(PAGE_PLACEHOLDER, "1")
}

fn stop_condition_hit(
    config: &PaginationConfig,
    signals: &PageSignals,
    duplicate: bool,
) -> Option<StopReason> {
    let mut conditions: Vec<&StopCondition> = config.stop_condition.iter().collect();
    conditions.sort_by_key(|c| c.priority());

    conditions.into_iter().find_map(|c| {
        let hit = match c {
            StopCondition::MaxItems { value } => signals.items_extracted_total >= *value,
            // A failed fetch says nothing about the results.
            _ if signals.fetch_failed => false,
            StopCondition::NoResults => signals.items_on_page == 0,
            StopCondition::DuplicateData => duplicate,
            StopCondition::SelectorMissing { .. } => signals.stop_selector_missing,
        };
        hit.then(|| match c {
            StopCondition::MaxItems { .. } => StopReason::MaxItems,
            StopCondition::NoResults => StopReason::NoResults,
            StopCondition::DuplicateData => StopReason::DuplicateData,
            StopCondition::SelectorMissing { .. } => StopReason::SelectorMissing,
        })
    })
}
