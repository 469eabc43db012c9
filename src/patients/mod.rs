//! Patient listing
//!
//! - [`model`]: the `Patient` record and its display name
//! - [`order`]: the three supported sort orders
//! - [`search`]: the paged search cursor
//! - [`list`]: the merged, sectioned list

pub mod list;
pub mod model;
pub mod order;
pub mod search;

pub use list::{build_sections, ListStatus, PatientList, Section, StatusEvent, PLACEHOLDER_TITLE};
pub use model::Patient;
pub use order::PatientListOrder;
pub use search::{PatientListQuery, PatientSearch, SearchPage};
