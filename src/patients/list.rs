//! Paginated, sectioned patient list
//!
//! [`PatientList`] fetches pages through a [`PatientSearch`] cursor, merges
//! them into one sorted collection, and rebuilds alphabetical [`Section`]s
//! after every merge.
//!
//! # Status
//!
//! The list moves through `Initialized -> Loading -> Ready`. Every change is
//! sent as a [`StatusEvent`] on the channel returned by
//! [`PatientList::subscribe`]. Events are sent while the state lock is
//! held, so observers see them in the order they were applied. A fetch
//! failure leaves the list `Ready` and rides along on that event exactly
//! once.
//!
//! # Ordering of fetches
//!
//! Fetches hold the cursor's async mutex for their whole duration, so pages
//! are applied in request order. Each fetch is tagged with the list's
//! generation; `retrieve` and `abort` bump it, and a page whose generation
//! is stale is discarded.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::error::Result;
use crate::gateway::RequestGateway;

use super::model::Patient;
use super::order::PatientListOrder;
use super::search::{PatientListQuery, PatientSearch, SearchPage};

/// Title of the trailing section standing in for patients not fetched yet.
pub const PLACEHOLDER_TITLE: &str = "…";

/// Lifecycle of a [`PatientList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStatus {
    Initialized,
    Loading,
    Ready,
}

/// A status change, with the error of the fetch that caused it (if any).
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub status: ListStatus,
    pub error: Option<Arc<anyhow::Error>>,
}

/// A contiguous run of patients sharing the first letter of their display
/// name, or the trailing placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub title: String,
    pub offset: usize,
    pub len: usize,
    pub placeholder: bool,
}

/// Computes sections for an already sorted list.
///
/// # Examples
///
/// ```
/// use smartfhir::patients::{build_sections, Patient};
///
/// let patients: Vec<Patient> = ["Adams", "Allen", "Baker"]
///     .iter()
///     .filter_map(|family| {
///         Patient::from_resource(serde_json::json!({
///             "resourceType": "Patient",
///             "name": [{"family": family, "given": ["X"]}]
///         }))
///     })
///     .collect();
///
/// let sections = build_sections(&patients, 5);
/// assert_eq!(sections.len(), 3);
/// assert_eq!((sections[0].title.as_str(), sections[0].len), ("A", 2));
/// assert_eq!((sections[1].offset, sections[1].len), (2, 1));
/// assert!(sections[2].placeholder);
/// assert_eq!(sections[2].len, 2);
/// ```
pub fn build_sections(patients: &[Patient], expected: usize) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();

    for (offset, patient) in patients.iter().enumerate() {
        let key: String = patient.display_name().chars().take(1).collect();
        match sections.last_mut() {
            Some(section) if section.title == key => section.len += 1,
            _ => sections.push(Section {
                title: key,
                offset,
                len: 1,
                placeholder: false,
            }),
        }
    }

    if patients.len() < expected {
        sections.push(Section {
            title: PLACEHOLDER_TITLE.to_string(),
            offset: patients.len(),
            len: expected - patients.len(),
            placeholder: true,
        });
    }

    sections
}

#[derive(Debug)]
struct ListState {
    status: ListStatus,
    patients: Vec<Patient>,
    expected: usize,
    sections: Vec<Section>,
    has_more: bool,
    last_error: Option<Arc<anyhow::Error>>,
    generation: u64,
    events: Option<mpsc::UnboundedSender<StatusEvent>>,
}

impl ListState {
    /// Sets the status and notifies the subscriber, consuming `last_error`.
    fn transition(&mut self, status: ListStatus) {
        self.status = status;
        let event = StatusEvent {
            status,
            error: self.last_error.take(),
        };
        tracing::debug!(?status, error = event.error.is_some(), "patient list status");
        if let Some(ref events) = self.events {
            if events.send(event).is_err() {
                self.events = None;
            }
        }
    }

    fn rebuild_sections(&mut self) {
        self.sections = build_sections(&self.patients, self.expected);
    }
}

/// A sorted, paginated list of patients.
#[derive(Debug)]
pub struct PatientList {
    order: PatientListOrder,
    state: Mutex<ListState>,
    search: tokio::sync::Mutex<PatientSearch>,
}

impl PatientList {
    pub fn new(gateway: RequestGateway, query: PatientListQuery) -> Self {
        Self {
            order: query.order,
            state: Mutex::new(ListState {
                status: ListStatus::Initialized,
                patients: Vec::new(),
                expected: 0,
                sections: Vec::new(),
                has_more: false,
                last_error: None,
                generation: 0,
                events: None,
            }),
            search: tokio::sync::Mutex::new(PatientSearch::new(gateway, query)),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ListState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the status channel. A new subscription replaces the previous
    /// one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock_state().events = Some(tx);
        rx
    }

    pub fn order(&self) -> PatientListOrder {
        self.order
    }

    pub fn status(&self) -> ListStatus {
        self.lock_state().status
    }

    pub fn patients(&self) -> Vec<Patient> {
        self.lock_state().patients.clone()
    }

    pub fn actual_count(&self) -> usize {
        self.lock_state().patients.len()
    }

    /// The server-reported total, never below [`actual_count`](Self::actual_count).
    pub fn expected_count(&self) -> usize {
        self.lock_state().expected
    }

    pub fn sections(&self) -> Vec<Section> {
        self.lock_state().sections.clone()
    }

    /// Whether another page can be fetched.
    pub fn has_more(&self) -> bool {
        self.lock_state().has_more
    }

    /// Clears the list and fetches the first page.
    pub async fn retrieve(&self) {
        let generation = {
            let mut state = self.lock_state();
            state.generation += 1;
            state.patients.clear();
            state.expected = 0;
            state.has_more = false;
            state.rebuild_sections();
            state.transition(ListStatus::Loading);
            state.generation
        };
        self.fetch(generation, false).await;
    }

    /// Fetches the next page and appends it. A no-op unless
    /// [`has_more`](Self::has_more).
    pub async fn retrieve_more(&self) {
        let generation = {
            let mut state = self.lock_state();
            if !state.has_more {
                return;
            }
            state.transition(ListStatus::Loading);
            state.generation
        };
        self.fetch(generation, true).await;
    }

    /// Supersedes any in-flight fetch. A `Loading` list becomes `Ready`
    /// once; the late page is discarded when it arrives.
    pub fn abort(&self) {
        let mut state = self.lock_state();
        state.generation += 1;
        if state.status == ListStatus::Loading {
            tracing::debug!("patient list fetch aborted");
            state.transition(ListStatus::Ready);
        }
    }

    async fn fetch(&self, generation: u64, append: bool) {
        let mut search = self.search.lock().await;
        if !append {
            search.reset();
        }
        let snapshot = search.clone();
        let result = search.next_page().await;

        let mut state = self.lock_state();
        if state.generation != generation {
            tracing::warn!(generation, current = state.generation, "discarding stale patient page");
            *search = snapshot;
            return;
        }
        let done = search.is_done();
        drop(search);

        self.apply(&mut state, result, append, done);
        state.transition(ListStatus::Ready);
    }

    fn apply(&self, state: &mut ListState, result: Result<SearchPage>, append: bool, done: bool) {
        match result {
            Ok(page) => {
                if let Some(total) = page.total {
                    let total = usize::try_from(total).unwrap_or(usize::MAX);
                    state.expected = state.expected.max(total);
                }
                state.patients.extend(page.patients);
                self.order.sort(&mut state.patients);
                state.expected = state.expected.max(state.patients.len());
                state.has_more = !done;
                tracing::debug!(
                    actual = state.patients.len(),
                    expected = state.expected,
                    has_more = state.has_more,
                    "patient page merged"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, append, "patient page fetch failed");
                if !append {
                    state.patients.clear();
                    state.expected = 0;
                }
                state.last_error = Some(Arc::new(e));
            }
        }
        state.rebuild_sections();
    }
}
