//! Paged `Patient` searches
//!
//! [`PatientSearch`] is a cursor over a search result. The first page is
//! requested from the query built by [`PatientListQuery`]; later pages
//! follow the Bundle's `next` link as returned by the server.

use serde_json::Value;

use crate::error::{Result, SmartError};
use crate::gateway::RequestGateway;

use super::model::Patient;
use super::order::PatientListOrder;

/// Parameters of the initial search request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatientListQuery {
    pub order: PatientListOrder,
    pub page_size: Option<u32>,
    /// Additional search parameters, sent verbatim.
    pub params: Vec<(String, String)>,
}

impl PatientListQuery {
    /// All patients in `order`.
    pub fn all(order: PatientListOrder) -> Self {
        Self {
            order,
            page_size: None,
            params: Vec::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Relative path of the first page, e.g. `Patient?_sort=family:asc,...&_count=50`.
    pub fn to_path(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in &self.params {
            query.append_pair(name, value);
        }
        query.append_pair("_sort", &self.order.sort_param());
        if let Some(count) = self.page_size {
            query.append_pair("_count", &count.to_string());
        }
        format!("Patient?{}", query.finish())
    }
}

/// One fetched page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchPage {
    /// `Bundle.total`, when reported.
    pub total: Option<u64>,
    pub patients: Vec<Patient>,
}

/// Cursor over a patient search.
#[derive(Debug, Clone)]
pub struct PatientSearch {
    gateway: RequestGateway,
    query: PatientListQuery,
    next: Option<String>,
    started: bool,
    done: bool,
}

impl PatientSearch {
    pub fn new(gateway: RequestGateway, query: PatientListQuery) -> Self {
        Self {
            gateway,
            query,
            next: None,
            started: false,
            done: false,
        }
    }

    pub fn query(&self) -> &PatientListQuery {
        &self.query
    }

    /// Whether the last page has been fetched.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Rewinds to the first page.
    pub fn reset(&mut self) {
        self.next = None;
        self.started = false;
        self.done = false;
    }

    /// Fetches the next page.
    ///
    /// A finished cursor returns an empty page without a request. On error
    /// the cursor is left unchanged, so the same page can be retried.
    pub async fn next_page(&mut self) -> Result<SearchPage> {
        if self.done {
            return Ok(SearchPage::default());
        }

        let path = match (&self.next, self.started) {
            (Some(next), _) => next.clone(),
            (None, false) => self.query.to_path(),
            (None, true) => {
                self.done = true;
                return Ok(SearchPage::default());
            }
        };

        tracing::debug!(%path, "fetching patient page");
        let bundle = self.gateway.get(&path).await?.into_body()?;
        let (page, next) = parse_bundle(&bundle)?;

        self.started = true;
        self.done = next.is_none();
        self.next = next;
        tracing::debug!(
            count = page.patients.len(),
            total = ?page.total,
            done = self.done,
            "patient page received"
        );
        Ok(page)
    }
}

/// Splits a searchset Bundle into its page and `next` link.
fn parse_bundle(bundle: &Value) -> Result<(SearchPage, Option<String>)> {
    if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
        return Err(SmartError::BodyParse {
            raw_body: bundle.to_string(),
            message: "search response is not a Bundle".to_string(),
        }
        .into());
    }

    let total = bundle.get("total").and_then(Value::as_u64);

    let next = bundle
        .get("link")
        .and_then(Value::as_array)
        .and_then(|links| {
            links
                .iter()
                .find(|l| l.get("relation").and_then(Value::as_str) == Some("next"))
        })
        .and_then(|l| l.get("url"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let patients = bundle
        .get("entry")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("resource"))
                .filter_map(|r| Patient::from_resource(r.clone()))
                .collect()
        })
        .unwrap_or_default();

    Ok((SearchPage { total, patients }, next))
}
