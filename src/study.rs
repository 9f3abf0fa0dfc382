//! Flattening one registry study payload into a [`TrialRecord`].
//!
//! Registry responses are loosely typed JSON: any module or key may be
//! missing, and occasionally a key carries a value of the wrong type. A
//! missing key becomes an absent attribute. A key of the wrong type also
//! becomes absent, and additionally leaves a [`FieldIssue`] on the record
//! so the problem is visible in the output row. Neither case stops the run.

use serde_json::Value;

use crate::models::{FieldIssue, Intervention, Location, TrialRecord};

/// Build a [`TrialRecord`] from one element of the response's `studies` array.
pub fn parse_study(study: &Value) -> TrialRecord {
    let mut r = FieldReader::default();

    if !study.is_object() {
        r.issue("study", "not a JSON object");
        return TrialRecord {
            issues: r.issues,
            ..Default::default()
        };
    }

    let Some(protocol) = r.object(study, &["protocolSection"], "protocol_section") else {
        r.issue("protocol_section", "missing");
        return TrialRecord {
            issues: r.issues,
            ..Default::default()
        };
    };

    let nct_id = r.string(protocol, &["identificationModule", "nctId"], "nct_id");
    if nct_id.is_none() {
        r.issue("nct_id", "missing");
    }

    let interventions = r
        .objects(
            protocol,
            &["armsInterventionsModule", "interventions"],
            "interventions",
        )
        .into_iter()
        .map(|item| Intervention {
            name: r.string(item, &["name"], "intervention_name"),
            kind: r.string(item, &["type"], "intervention_type"),
            description: r.string(item, &["description"], "intervention_description"),
        })
        .collect();

    let locations = r
        .objects(protocol, &["contactsLocationsModule", "locations"], "locations")
        .into_iter()
        .map(|item| Location {
            country: r.string(item, &["country"], "country"),
            city: r.string(item, &["city"], "city"),
        })
        .collect();

    TrialRecord {
        nct_id,
        brief_title: r.string(protocol, &["identificationModule", "briefTitle"], "title"),
        official_title: r.string(
            protocol,
            &["identificationModule", "officialTitle"],
            "official_title",
        ),
        organization_class: r.string(
            protocol,
            &["identificationModule", "organization", "class"],
            "organization_class",
        ),
        study_type: r.string(protocol, &["designModule", "studyType"], "study_type"),
        status: r.string(protocol, &["statusModule", "overallStatus"], "status"),
        start_date: r.string(
            protocol,
            &["statusModule", "startDateStruct", "date"],
            "start_date",
        ),
        completion_date: r.string(
            protocol,
            &["statusModule", "completionDateStruct", "date"],
            "completion_date",
        ),
        last_update_date: r.string(
            protocol,
            &["statusModule", "lastUpdatePostDateStruct", "date"],
            "last_update_date",
        ),
        phases: r.strings(protocol, &["designModule", "phases"], "phase"),
        sponsor: r.string(
            protocol,
            &["sponsorCollaboratorsModule", "leadSponsor", "name"],
            "sponsor",
        ),
        conditions: r.strings(protocol, &["conditionsModule", "conditions"], "conditions"),
        keywords: r.strings(protocol, &["conditionsModule", "keywords"], "keywords"),
        brief_summary: r.string(
            protocol,
            &["descriptionModule", "briefSummary"],
            "brief_summary",
        ),
        detailed_description: r.string(
            protocol,
            &["descriptionModule", "detailedDescription"],
            "detailed_description",
        ),
        interventions,
        locations,
        sex: r.string(protocol, &["eligibilityModule", "sex"], "gender"),
        minimum_age: r.string(protocol, &["eligibilityModule", "minimumAge"], "minimum_age"),
        maximum_age: r.string(protocol, &["eligibilityModule", "maximumAge"], "maximum_age"),
        healthy_volunteers: r.boolean(
            protocol,
            &["eligibilityModule", "healthyVolunteers"],
            "healthy_volunteers",
        ),
        enrollment: r.count(
            protocol,
            &["designModule", "enrollmentInfo", "count"],
            "enrollment",
        ),
        eligibility_criteria: r.string(
            protocol,
            &["eligibilityModule", "eligibilityCriteria"],
            "eligibility_criteria",
        ),
        issues: r.issues,
    }
}

/// Reads typed values out of a payload, collecting issues as it goes.
#[derive(Default)]
struct FieldReader {
    issues: Vec<FieldIssue>,
}

impl FieldReader {
    fn issue(&mut self, field: &str, reason: impl Into<String>) {
        // One issue per field is enough to flag it.
        if !self.issues.iter().any(|i| i.field == field) {
            self.issues.push(FieldIssue::new(field, reason));
        }
    }

    /// Walk `path` from `root`. `None` when any step is missing or null;
    /// an intermediate value that is not an object is reported.
    fn lookup<'v>(&mut self, root: &'v Value, path: &[&str], field: &str) -> Option<&'v Value> {
        let mut current = root;
        for key in path {
            match current {
                Value::Object(map) => current = map.get(*key)?,
                Value::Null => return None,
                other => {
                    self.issue(field, format!("expected object at '{}', found {}", key, kind(other)));
                    return None;
                }
            }
        }
        match current {
            Value::Null => None,
            value => Some(value),
        }
    }

    fn object<'v>(&mut self, root: &'v Value, path: &[&str], field: &str) -> Option<&'v Value> {
        match self.lookup(root, path, field)? {
            value @ Value::Object(_) => Some(value),
            other => {
                self.issue(field, format!("expected object, found {}", kind(other)));
                None
            }
        }
    }

    fn string(&mut self, root: &Value, path: &[&str], field: &str) -> Option<String> {
        match self.lookup(root, path, field)? {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            other => {
                self.issue(field, format!("expected text, found {}", kind(other)));
                None
            }
        }
    }

    fn strings(&mut self, root: &Value, path: &[&str], field: &str) -> Vec<String> {
        let Some(value) = self.lookup(root, path, field) else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            self.issue(field, format!("expected list, found {}", kind(value)));
            return Vec::new();
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Value::String(s) if !s.trim().is_empty() => out.push(s.trim().to_string()),
                Value::String(_) | Value::Null => {}
                other => self.issue(field, format!("expected text item, found {}", kind(other))),
            }
        }
        out
    }

    fn objects<'v>(&mut self, root: &'v Value, path: &[&str], field: &str) -> Vec<&'v Value> {
        let Some(value) = self.lookup(root, path, field) else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            self.issue(field, format!("expected list, found {}", kind(value)));
            return Vec::new();
        };
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            if item.is_object() {
                out.push(item);
            } else {
                self.issue(field, format!("expected object item, found {}", kind(item)));
            }
        }
        out
    }

    fn boolean(&mut self, root: &Value, path: &[&str], field: &str) -> Option<bool> {
        match self.lookup(root, path, field)? {
            Value::Bool(b) => Some(*b),
            other => {
                self.issue(field, format!("expected true/false, found {}", kind(other)));
                None
            }
        }
    }

    /// A non-negative whole number. Numeric strings are accepted.
    fn count(&mut self, root: &Value, path: &[&str], field: &str) -> Option<u64> {
        let value = self.lookup(root, path, field)?;
        let parsed = match value {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64)),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        if parsed.is_none() {
            self.issue(field, format!("expected whole number, found {}", value));
        }
        parsed
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "text",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}
