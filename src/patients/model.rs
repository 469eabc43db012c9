//! Patient records
//!
//! Patients are kept as the raw JSON resource. Only the fields used for
//! sorting, sectioning, and display are interpreted.

use chrono::NaiveDate;
use serde_json::Value;

/// A `Patient` resource.
///
/// # Examples
///
/// ```
/// use smartfhir::patients::Patient;
///
/// let patient = Patient::from_resource(serde_json::json!({
///     "resourceType": "Patient",
///     "id": "p1",
///     "name": [{"family": "Smith", "given": ["Bob", "J"]}],
///     "birthDate": "1970-03-04"
/// }))
/// .unwrap();
///
/// assert_eq!(patient.display_name(), "Smith, Bob J");
/// assert_eq!(patient.birth_date().unwrap().to_string(), "1970-03-04");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Patient(Value);

impl Patient {
    /// Wraps `resource` when it is a `Patient`.
    pub fn from_resource(resource: Value) -> Option<Self> {
        match resource.get("resourceType").and_then(Value::as_str) {
            Some("Patient") => Some(Self(resource)),
            _ => None,
        }
    }

    pub fn resource(&self) -> &Value {
        &self.0
    }

    pub fn into_resource(self) -> Value {
        self.0
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn gender(&self) -> Option<&str> {
        self.0.get("gender").and_then(Value::as_str)
    }

    /// The `official` name, else the first name listed.
    fn primary_name(&self) -> Option<&Value> {
        let names = self.0.get("name")?.as_array()?;
        names
            .iter()
            .find(|n| n.get("use").and_then(Value::as_str) == Some("official"))
            .or_else(|| names.first())
    }

    /// Given names joined with spaces.
    pub fn given_name(&self) -> Option<String> {
        let given: Vec<&str> = self
            .primary_name()?
            .get("given")?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .filter(|g| !g.is_empty())
            .collect();
        (!given.is_empty()).then(|| given.join(" "))
    }

    pub fn family_name(&self) -> Option<&str> {
        self.primary_name()?
            .get("family")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
    }

    /// `birthDate`; partial dates (`YYYY`, `YYYY-MM`) resolve to their first day.
    pub fn birth_date(&self) -> Option<NaiveDate> {
        let raw = self.0.get("birthDate")?.as_str()?;
        let mut parts = raw.splitn(3, '-');
        let year = parts.next()?.parse().ok()?;
        let month = parts.next().map_or(Some(1), |m| m.parse().ok())?;
        let day = parts.next().map_or(Some(1), |d| d.parse().ok())?;
        NaiveDate::from_ymd_opt(year, month, day)
    }

    /// "Family, Given", falling back to "Mr./Ms. Family", the given name
    /// alone, or "Unnamed".
    pub fn display_name(&self) -> String {
        match (self.family_name(), self.given_name()) {
            (Some(family), Some(given)) => format!("{family}, {given}"),
            (Some(family), None) => format!("{} {family}", self.salutation()),
            (None, Some(given)) => given,
            (None, None) => "Unnamed".to_string(),
        }
    }

    fn salutation(&self) -> &'static str {
        match self.gender() {
            Some("male") => "Mr.",
            Some("female") => "Ms.",
            _ => "Mr./Ms.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient(value: Value) -> Patient {
        Patient::from_resource(value).unwrap()
    }

    #[test]
    fn test_non_patient_resource_is_rejected() {
        assert!(Patient::from_resource(json!({"resourceType": "Observation"})).is_none());
        assert!(Patient::from_resource(json!({"id": "x"})).is_none());
    }

    #[test]
    fn test_official_name_is_preferred() {
        let p = patient(json!({
            "resourceType": "Patient",
            "name": [
                {"use": "nickname", "given": ["Bobby"]},
                {"use": "official", "family": "Smith", "given": ["Robert"]}
            ]
        }));
        assert_eq!(p.given_name().as_deref(), Some("Robert"));
        assert_eq!(p.family_name(), Some("Smith"));
    }

    #[test]
    fn test_display_name_fallbacks() {
        let male = patient(json!({"resourceType": "Patient", "gender": "male", "name": [{"family": "Adams"}]}));
        assert_eq!(male.display_name(), "Mr. Adams");

        let female = patient(json!({"resourceType": "Patient", "gender": "female", "name": [{"family": "Adams"}]}));
        assert_eq!(female.display_name(), "Ms. Adams");

        let unknown = patient(json!({"resourceType": "Patient", "name": [{"family": "Adams"}]}));
        assert_eq!(unknown.display_name(), "Mr./Ms. Adams");

        let given_only = patient(json!({"resourceType": "Patient", "name": [{"given": ["Zoe"]}]}));
        assert_eq!(given_only.display_name(), "Zoe");

        let nameless = patient(json!({"resourceType": "Patient"}));
        assert_eq!(nameless.display_name(), "Unnamed");
    }

    #[test]
    fn test_partial_birth_dates() {
        let year = patient(json!({"resourceType": "Patient", "birthDate": "1984"}));
        assert_eq!(year.birth_date(), NaiveDate::from_ymd_opt(1984, 1, 1));

        let month = patient(json!({"resourceType": "Patient", "birthDate": "1984-07"}));
        assert_eq!(month.birth_date(), NaiveDate::from_ymd_opt(1984, 7, 1));

        let bad = patient(json!({"resourceType": "Patient", "birthDate": "unknown"}));
        assert_eq!(bad.birth_date(), None);
    }
}
