//! Status-page extraction: judge HTML into accepted [`SubmissionRecord`]s.

use std::collections::HashSet;

use chrono::{DateTime, Duration, FixedOffset, Offset, TimeZone, Utc};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use solvelog_core::{parse_submitted_at, RecordKey, SubmissionRecord};
use solvelog_storage::DuplicateFilter;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub const CRATE_NAME: &str = "solvelog-adapters";

/// Accepted submissions at least this many hours old are ignored.
pub const DEFAULT_FRESHNESS_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("status page for {username} is malformed: {detail}")]
    PageFormat { username: String, detail: String },
}

/// CSS contract of the judge's status page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPageSelectors {
    pub table: String,
    pub row: String,
    pub accepted_marker: String,
    pub submitted_time: String,
    pub problem_link: String,
    pub submission_cell: String,
    pub memory_cell: String,
    pub time_cell: String,
}

impl Default for StatusPageSelectors {
    fn default() -> Self {
        Self {
            table: "table#status-table".to_string(),
            row: "tr".to_string(),
            accepted_marker: "span.result-text.result-ac".to_string(),
            submitted_time: "a.real-time-update".to_string(),
            problem_link: "a.problem_title".to_string(),
            submission_cell: "td".to_string(),
            memory_cell: "td.memory".to_string(),
            time_cell: "td.time".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledSelectors {
    table: Selector,
    row: Selector,
    accepted_marker: Selector,
    submitted_time: Selector,
    problem_link: Selector,
    submission_cell: Selector,
    memory_cell: Selector,
    time_cell: Selector,
}

fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

impl CompiledSelectors {
    fn compile(raw: &StatusPageSelectors) -> Result<Self, ExtractError> {
        Ok(Self {
            table: compile(&raw.table)?,
            row: compile(&raw.row)?,
            accepted_marker: compile(&raw.accepted_marker)?,
            submitted_time: compile(&raw.submitted_time)?,
            problem_link: compile(&raw.problem_link)?,
            submission_cell: compile(&raw.submission_cell)?,
            memory_cell: compile(&raw.memory_cell)?,
            time_cell: compile(&raw.time_cell)?,
        })
    }
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Turns one user's status page into fresh, not-yet-stored accepted submissions.
#[derive(Debug, Clone)]
pub struct SubmissionExtractor {
    base_url: Url,
    site_offset: FixedOffset,
    freshness_window: Duration,
    selectors: CompiledSelectors,
}

impl SubmissionExtractor {
    pub fn new(base_url: Url) -> Result<Self, ExtractError> {
        Self::with_selectors(base_url, &StatusPageSelectors::default())
    }

    pub fn with_selectors(base_url: Url, selectors: &StatusPageSelectors) -> Result<Self, ExtractError> {
        Ok(Self {
            base_url,
            site_offset: Utc.fix(),
            freshness_window: Duration::hours(DEFAULT_FRESHNESS_WINDOW_HOURS),
            selectors: CompiledSelectors::compile(selectors)?,
        })
    }

    /// Offset the judge renders submission times in.
    pub fn with_site_offset(mut self, offset: FixedOffset) -> Self {
        self.site_offset = offset;
        self
    }

    pub fn with_freshness_window(mut self, window: Duration) -> Self {
        self.freshness_window = window;
        self
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Full extraction: page parse, then the store check for each surviving candidate.
    pub async fn extract(
        &self,
        html: &str,
        username: &str,
        now: DateTime<Utc>,
        filter: &DuplicateFilter,
    ) -> Result<Vec<SubmissionRecord>, ExtractError> {
        let candidates = self.parse_candidates(html, username, now)?;
        let mut accepted = Vec::with_capacity(candidates.len());
        for record in candidates {
            if filter.exists(&record.username, &record.problem_id).await {
                debug!(username, problem_id = %record.problem_id, "already stored; skipping");
                continue;
            }
            accepted.push(record);
        }
        Ok(accepted)
    }

    /// Accepted, fresh rows with in-page repeats removed (first occurrence wins).
    ///
    /// Purely synchronous; the parsed document never outlives this call.
    pub fn parse_candidates(
        &self,
        html: &str,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<SubmissionRecord>, ExtractError> {
        let document = Html::parse_document(html);
        let Some(table) = document.select(&self.selectors.table).next() else {
            info!(username, "status table not found; no data for user");
            return Ok(Vec::new());
        };

        let mut seen: HashSet<RecordKey> = HashSet::new();
        let mut out = Vec::new();

        for row in table.select(&self.selectors.row) {
            if row.select(&self.selectors.accepted_marker).next().is_none() {
                continue;
            }

            let submitted_at = self.row_submitted_at(row, username)?;
            let submitted_utc = self
                .site_offset
                .from_local_datetime(&submitted_at)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| page_format(username, "submission time has no single instant"))?;
            if now.signed_duration_since(submitted_utc) >= self.freshness_window {
                continue;
            }

            let link = row
                .select(&self.selectors.problem_link)
                .next()
                .ok_or_else(|| page_format(username, "accepted row without problem link"))?;
            let problem_id = element_text(link);
            if problem_id.is_empty() {
                return Err(page_format(username, "problem link has no text"));
            }

            let key = RecordKey::new(username, problem_id.as_str());
            if !seen.insert(key) {
                debug!(username, problem_id = %problem_id, "repeated on page; skipping");
                continue;
            }

            let href = link
                .value()
                .attr("href")
                .ok_or_else(|| page_format(username, "problem link without href"))?;
            let problem_url = self
                .problem_url(href)
                .map_err(|e| page_format(username, format!("problem href `{href}`: {e}")))?;

            let submission_id = self.required_cell(row, &self.selectors.submission_cell, username, "submission")?;
            let memory_used = self.required_cell(row, &self.selectors.memory_cell, username, "memory")?;
            let time_spent = self.required_cell(row, &self.selectors.time_cell, username, "time")?;

            debug!(
                username,
                problem_id = %problem_id,
                submission_id = %submission_id,
                %submitted_at,
                "accepted submission"
            );

            out.push(SubmissionRecord {
                username: username.to_string(),
                problem_id,
                submission_id,
                problem_url: problem_url.to_string(),
                submitted_at,
                memory_used,
                time_spent,
            });
        }

        Ok(out)
    }

    /// Site-relative hrefs land under the base URL's path, like the status page itself.
    fn problem_url(&self, href: &str) -> Result<Url, url::ParseError> {
        if let Ok(absolute) = Url::parse(href) {
            return Ok(absolute);
        }
        let prefix = self.base_url.path().trim_end_matches('/');
        let rooted = format!("{prefix}/{}", href.trim_start_matches('/'));
        self.base_url.join(&rooted)
    }

    fn row_submitted_at(
        &self,
        row: ElementRef<'_>,
        username: &str,
    ) -> Result<chrono::NaiveDateTime, ExtractError> {
        let raw = row
            .select(&self.selectors.submitted_time)
            .next()
            .and_then(|el| el.value().attr("title"))
            .ok_or_else(|| page_format(username, "accepted row without submission time"))?;
        parse_submitted_at(raw)
            .map_err(|e| page_format(username, format!("submission time `{raw}`: {e}")))
    }

    fn required_cell(
        &self,
        row: ElementRef<'_>,
        selector: &Selector,
        username: &str,
        what: &str,
    ) -> Result<String, ExtractError> {
        row.select(selector)
            .next()
            .map(element_text)
            .ok_or_else(|| page_format(username, format!("accepted row without {what} cell")))
    }
}

fn page_format(username: &str, detail: impl Into<String>) -> ExtractError {
    ExtractError::PageFormat {
        username: username.to_string(),
        detail: detail.into(),
    }
}
