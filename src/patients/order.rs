//! Patient list orderings
//!
//! Each ordering is a three-key lexicographic comparison. Missing names
//! compare as [`MISSING_NAME`] and missing birth dates as
//! [`missing_birth_date`], so every ordering is total.

use std::cmp::Ordering;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::SmartError;

use super::model::Patient;

/// Sort key used for a missing given or family name.
pub const MISSING_NAME: &str = "ZZZ";

/// Sort key used for a missing birth date: 1900-01-01, seventy years before
/// the Unix epoch.
pub fn missing_birth_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1900, 1, 1).unwrap_or(NaiveDate::MIN)
}

/// Sort order of a patient list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatientListOrder {
    /// Given name, family name, birth date.
    ByGivenNameAsc,
    /// Family name, given name, birth date.
    #[default]
    ByFamilyNameAsc,
    /// Birth date, family name, given name.
    ByBirthDateAsc,
}

#[derive(Clone, Copy)]
enum SortKey {
    Given,
    Family,
    BirthDate,
}

impl SortKey {
    fn search_param(self) -> &'static str {
        match self {
            SortKey::Given => "given",
            SortKey::Family => "family",
            SortKey::BirthDate => "birthdate",
        }
    }

    fn compare(self, a: &Patient, b: &Patient) -> Ordering {
        match self {
            SortKey::Given => {
                let a = a.given_name();
                let b = b.given_name();
                a.as_deref()
                    .unwrap_or(MISSING_NAME)
                    .cmp(b.as_deref().unwrap_or(MISSING_NAME))
            }
            SortKey::Family => a
                .family_name()
                .unwrap_or(MISSING_NAME)
                .cmp(b.family_name().unwrap_or(MISSING_NAME)),
            SortKey::BirthDate => a
                .birth_date()
                .unwrap_or_else(missing_birth_date)
                .cmp(&b.birth_date().unwrap_or_else(missing_birth_date)),
        }
    }
}

impl PatientListOrder {
    pub const ALL: [PatientListOrder; 3] = [
        PatientListOrder::ByGivenNameAsc,
        PatientListOrder::ByFamilyNameAsc,
        PatientListOrder::ByBirthDateAsc,
    ];

    fn keys(self) -> [SortKey; 3] {
        match self {
            PatientListOrder::ByGivenNameAsc => [SortKey::Given, SortKey::Family, SortKey::BirthDate],
            PatientListOrder::ByFamilyNameAsc => [SortKey::Family, SortKey::Given, SortKey::BirthDate],
            PatientListOrder::ByBirthDateAsc => [SortKey::BirthDate, SortKey::Family, SortKey::Given],
        }
    }

    pub fn compare(self, a: &Patient, b: &Patient) -> Ordering {
        self.keys()
            .iter()
            .fold(Ordering::Equal, |acc, key| acc.then_with(|| key.compare(a, b)))
    }

    /// Stable sort of `patients` in this order.
    pub fn sort(self, patients: &mut [Patient]) {
        patients.sort_by(|a, b| self.compare(a, b));
    }

    /// Value of the `_sort` search parameter, e.g. `family:asc,given:asc,birthdate:asc`.
    pub fn sort_param(self) -> String {
        self.keys()
            .iter()
            .map(|key| format!("{}:asc", key.search_param()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl std::fmt::Display for PatientListOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PatientListOrder::ByGivenNameAsc => "given",
            PatientListOrder::ByFamilyNameAsc => "family",
            PatientListOrder::ByBirthDateAsc => "birthdate",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for PatientListOrder {
    type Err = SmartError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "given" | "by_given_name_asc" => Ok(PatientListOrder::ByGivenNameAsc),
            "family" | "by_family_name_asc" => Ok(PatientListOrder::ByFamilyNameAsc),
            "birthdate" | "birth_date" | "by_birth_date_asc" => Ok(PatientListOrder::ByBirthDateAsc),
            other => Err(SmartError::Config(format!("unknown patient order '{other}'"))),
        }
    }
}
