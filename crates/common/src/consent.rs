//! Consent records, audit events, and the aggregate views built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The current consent state of one student, one row per student.
///
/// Invariant: `withdrawn == true` implies `consent_given == false`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub id: Uuid,
    pub student_id: Uuid,
    pub consent_given: bool,
    /// Verbatim consent text the consenter agreed to.
    pub consent_text: Option<String>,
    pub consent_date: Option<DateTime<Utc>>,
    /// The user who gave consent: the student or a parent/guardian.
    pub consented_by: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub withdrawn: bool,
    pub withdrawn_date: Option<DateTime<Utc>>,
    pub withdrawn_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsentRecord {
    /// Current state of this record.
    pub fn state(&self) -> ConsentState {
        if self.withdrawn {
            ConsentState::Withdrawn
        } else if self.consent_given {
            ConsentState::Consented
        } else {
            ConsentState::NoRecord
        }
    }

    /// `true` while the student has an active, non-withdrawn consent.
    pub fn is_active(&self) -> bool {
        self.state() == ConsentState::Consented
    }

    /// Check the record-level invariants.
    pub fn is_consistent(&self) -> bool {
        if self.withdrawn && self.consent_given {
            return false;
        }
        if self.consent_given && self.consent_date.is_none() {
            return false;
        }
        if self.withdrawn && self.withdrawn_date.is_none() {
            return false;
        }
        true
    }
}

/// Consent state of a subject. There is no terminal state: withdrawal and
/// re-consent may alternate indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    NoRecord,
    Consented,
    Withdrawn,
}

impl ConsentState {
    /// Fold an event history (oldest first) into the state it produces.
    pub fn replay(events: &[ConsentEvent]) -> Self {
        events
            .iter()
            .fold(ConsentState::NoRecord, |_, event| match event.action {
                ConsentAction::Given => ConsentState::Consented,
                ConsentAction::Withdrawn => ConsentState::Withdrawn,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentAction {
    Given,
    Withdrawn,
}

/// One entry of the append-only consent history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentEvent {
    pub id: Uuid,
    pub student_id: Uuid,
    pub action: ConsentAction,
    pub at: DateTime<Utc>,
    /// Who performed the action, when known.
    pub actor: Option<Uuid>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub reason: Option<String>,
    pub consent_text: Option<String>,
}

/// A consent record joined with the decrypted display names of the student
/// and the consenter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsentView {
    #[serde(flatten)]
    pub record: ConsentRecord,
    pub student_name: Option<String>,
    pub consenter_name: Option<String>,
}

/// Aggregate consent counts, recomputed on every request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentStats {
    pub total_students: u64,
    pub consented: u64,
    pub not_consented: u64,
    pub withdrawn: u64,
}

impl ConsentStats {
    /// Build the stats from raw counts; `not_consented` is derived.
    pub fn from_counts(total_students: u64, consented: u64, withdrawn: u64) -> Self {
        Self {
            total_students,
            consented,
            not_consented: total_students.saturating_sub(consented),
            withdrawn,
        }
    }
}

/// One page of a paginated listing. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn empty(page: usize, per_page: usize) -> Self {
        Self {
            items: Vec::new(),
            page,
            per_page,
            total: 0,
        }
    }
}
