//! Inbound submissions and the payload validator.
//!
//! Trials are kept as opaque JSON objects: the service stores whatever the
//! experiment runner sent and only checks the identifying fields it needs.

use crate::error::{Result, SubmissionError};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::fmt;

/// One recorded experimental event, passed through verbatim.
pub type TrialRecord = JsonMap<String, JsonValue>;

/// Field injected into every trial that does not already identify its subject.
pub const SUBJECT_ID_FIELD: &str = "subject_id";

pub const MISSING_PARTICIPANT_MESSAGE: &str = "Missing participantId";
pub const MISSING_ALL_TRIAL_DATA_MESSAGE: &str = "Missing or empty allTrialData array";
pub const MISSING_TRIAL_DATA_MESSAGE: &str = "Missing trialData object";
pub const INVALID_DURATION_MESSAGE: &str = "saveDurationMs must be a number";
pub const NOT_AN_OBJECT_MESSAGE: &str = "Request body must be a JSON object";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    /// A single trial posted while the experiment is running.
    Trial,
    /// The complete data set posted when the experiment ends.
    Final,
}

impl SubmissionKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Final => "final",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "trial" => Some(Self::Trial),
            "final" => Some(Self::Final),
            _ => None,
        }
    }
}

impl fmt::Display for SubmissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated submission. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub kind: SubmissionKind,
    pub participant_id: String,
    /// Raw trial items in submission order. Items that are not JSON objects
    /// are kept here and skipped at replication time.
    pub trials: Vec<JsonValue>,
    pub save_duration_ms: Option<f64>,
}

/// Trials ready for replication, with the subject id injected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreparedTrials {
    pub records: Vec<TrialRecord>,
    pub skipped: usize,
}

impl Submission {
    /// Decodes and validates a raw request body.
    pub fn from_body(kind: SubmissionKind, body: &[u8]) -> Result<Self> {
        let value: JsonValue = serde_json::from_slice(body)
            .map_err(|err| SubmissionError::validation(format!("Malformed JSON body: {err}")))?;
        Self::from_value(kind, value)
    }

    pub fn from_value(kind: SubmissionKind, value: JsonValue) -> Result<Self> {
        let JsonValue::Object(mut body) = value else {
            return Err(SubmissionError::validation(NOT_AN_OBJECT_MESSAGE));
        };

        let participant_id = match body.get("participantId") {
            Some(JsonValue::String(raw)) if !raw.trim().is_empty() => raw.clone(),
            _ => return Err(SubmissionError::validation(MISSING_PARTICIPANT_MESSAGE)),
        };

        let trials = match kind {
            SubmissionKind::Final => match body.remove("allTrialData") {
                Some(JsonValue::Array(items)) if !items.is_empty() => items,
                _ => return Err(SubmissionError::validation(MISSING_ALL_TRIAL_DATA_MESSAGE)),
            },
            SubmissionKind::Trial => match body.remove("trialData") {
                Some(trial @ JsonValue::Object(_)) => vec![trial],
                _ => return Err(SubmissionError::validation(MISSING_TRIAL_DATA_MESSAGE)),
            },
        };

        let save_duration_ms = match body.get("saveDurationMs") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::Number(number)) => number.as_f64(),
            Some(_) => return Err(SubmissionError::validation(INVALID_DURATION_MESSAGE)),
        };

        Ok(Self {
            kind,
            participant_id,
            trials,
            save_duration_ms,
        })
    }

    /// Drops non-object items and tags every record with the participant id
    /// unless it already carries a non-empty subject id.
    pub fn prepare_trials(&self) -> PreparedTrials {
        let mut prepared = PreparedTrials::default();
        for item in &self.trials {
            let JsonValue::Object(record) = item else {
                prepared.skipped += 1;
                continue;
            };

            let mut record = record.clone();
            let has_subject = match record.get(SUBJECT_ID_FIELD) {
                None | Some(JsonValue::Null) => false,
                Some(JsonValue::String(existing)) => !existing.is_empty(),
                Some(_) => true,
            };
            if !has_subject {
                record.insert(
                    SUBJECT_ID_FIELD.to_string(),
                    JsonValue::String(self.participant_id.clone()),
                );
            }
            prepared.records.push(record);
        }
        prepared
    }
}
