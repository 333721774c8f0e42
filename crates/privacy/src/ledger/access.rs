//! Who may see which consent record.
//!
//! A record the caller may not see is reported exactly like a missing one,
//! so its existence does not leak.

use common::{ConsentRecord, Role};
use uuid::Uuid;

/// The authenticated user on whose behalf a ledger read is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: Uuid,
    pub role: Role,
}

impl Caller {
    pub fn new(user_id: Uuid, role: Role) -> Self {
        Self { user_id, role }
    }

    /// Staff see every record, students their own, consenters the records
    /// they gave consent on.
    pub fn can_view(&self, record: &ConsentRecord) -> bool {
        self.can_view_subject(record.student_id) || record.consented_by == Some(self.user_id)
    }

    /// Visibility that holds without looking at a record.
    pub fn can_view_subject(&self, student_id: Uuid) -> bool {
        self.role.is_staff() || self.user_id == student_id
    }

    /// Staff and the student may always give consent. Anyone else only for a
    /// student without a record, or on a record they already consented on.
    pub fn can_give(&self, student_id: Uuid, existing: Option<&ConsentRecord>) -> bool {
        if self.can_view_subject(student_id) {
            return true;
        }
        existing.map_or(true, |r| r.consented_by == Some(self.user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(student_id: Uuid, consented_by: Option<Uuid>) -> ConsentRecord {
        let now = Utc::now();
        ConsentRecord {
            id: Uuid::new_v4(),
            student_id,
            consent_given: true,
            consent_text: None,
            consent_date: Some(now),
            consented_by,
            ip_address: None,
            user_agent: None,
            withdrawn: false,
            withdrawn_date: None,
            withdrawn_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn visibility_rules() {
        let student = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        let r = record(student, Some(parent));

        assert!(Caller::new(Uuid::new_v4(), Role::Admin).can_view(&r));
        assert!(Caller::new(Uuid::new_v4(), Role::Teacher).can_view(&r));
        assert!(Caller::new(student, Role::Student).can_view(&r));
        assert!(Caller::new(parent, Role::Parent).can_view(&r));
        assert!(!Caller::new(stranger, Role::Parent).can_view(&r));
        assert!(!Caller::new(stranger, Role::Student).can_view(&r));
    }

    #[test]
    fn only_the_original_consenter_may_renew() {
        let student = Uuid::new_v4();
        let parent = Uuid::new_v4();
        let stranger = Caller::new(Uuid::new_v4(), Role::Parent);
        let r = record(student, Some(parent));

        assert!(stranger.can_give(student, None));
        assert!(!stranger.can_give(student, Some(&r)));
        assert!(Caller::new(parent, Role::Parent).can_give(student, Some(&r)));
        assert!(Caller::new(student, Role::Student).can_give(student, Some(&r)));
        assert!(Caller::new(Uuid::new_v4(), Role::Teacher).can_give(student, Some(&r)));
    }
}
