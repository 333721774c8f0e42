//! Consent Ledger: per-student consent state with audit metadata.
//!
//! # State machine
//!
//! ```text
//! NoRecord ──give──► Consented ──withdraw──► Withdrawn ──give──► Consented ...
//! ```
//!
//! There is no terminal state.
//!
//! # Storage
//!
//! - `student_consents` holds the current state, one row per student. Every
//!   transition is one insert or one update that carries all changed columns,
//!   so a transition is never half-applied.
//! - `consent_events` is append-only history. The event is written after the
//!   row; a failed append is logged and does not undo the transition.
//!
//! Concurrent transitions for the same student are last-writer-wins. Two first
//! consents racing on the unique `student_id` end with the loser updating the
//! winner's row.

pub mod access;
pub mod clock;
pub mod error;
pub mod ip;

pub use access::Caller;
#[cfg(test)]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use error::LedgerError;
pub use ip::{HttpIpLookup, IpLookup};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use common::{
    ConsentAction, ConsentEvent, ConsentRecord, ConsentStats, ConsentView, Page, Profile, Role,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::ProfileCodec;
use crate::store::{
    Filter, Query, Row, Store, StoreError, CONSENT_EVENTS, PROFILES, STUDENT_CONSENTS,
};

/// Largest page the admin listing will return.
pub const MAX_PAGE_SIZE: usize = 100;

/// Input of [`ConsentLedger::give_consent`].
#[derive(Debug, Clone)]
pub struct GiveConsent {
    pub student_id: Uuid,
    /// The student or the parent/guardian acting for them.
    pub consented_by: Uuid,
    /// When `None`, the configured [`IpLookup`] is consulted.
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl GiveConsent {
    pub fn new(student_id: Uuid, consented_by: Uuid) -> Self {
        Self {
            student_id,
            consented_by,
            ip_address: None,
            user_agent: None,
        }
    }
}

/// The consent ledger service.
pub struct ConsentLedger {
    store: Arc<dyn Store>,
    codec: ProfileCodec,
    consent_text: String,
    clock: Arc<dyn Clock>,
    ip_lookup: Option<Arc<dyn IpLookup>>,
}

impl ConsentLedger {
    /// Create a ledger that stores `consent_text` verbatim with every consent.
    pub fn new(store: Arc<dyn Store>, codec: ProfileCodec, consent_text: impl Into<String>) -> Self {
        Self {
            store,
            codec,
            consent_text: consent_text.into(),
            clock: Arc::new(SystemClock),
            ip_lookup: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ip_lookup(mut self, lookup: Arc<dyn IpLookup>) -> Self {
        self.ip_lookup = Some(lookup);
        self
    }

    pub fn consent_text(&self) -> &str {
        &self.consent_text
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// The student's consent joined with decrypted display names.
    ///
    /// `Ok(None)` when there is no record or the caller may not see it.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn get_student_consent(
        &self,
        caller: &Caller,
        student_id: Uuid,
    ) -> Result<Option<ConsentView>, LedgerError> {
        let Some(record) = self
            .find_record(student_id)
            .await
            .inspect_err(|e| error!(error = %e, "failed to load consent"))?
        else {
            return Ok(None);
        };
        if !caller.can_view(&record) {
            debug!("consent hidden from caller");
            return Ok(None);
        }

        let (student_name, consenter_name) = tokio::join!(
            self.display_name(Some(record.student_id)),
            self.display_name(record.consented_by),
        );
        Ok(Some(ConsentView {
            record,
            student_name,
            consenter_name,
        }))
    }

    /// Current consent of several students, keyed by student id. Students
    /// without a visible record are absent from the map.
    #[instrument(skip_all, fields(caller = %caller.user_id, count = student_ids.len()))]
    pub async fn get_students_consent(
        &self,
        caller: &Caller,
        student_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, ConsentRecord>, LedgerError> {
        if student_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let query = Query::new().filter(Filter::is_in(
            "student_id",
            student_ids.iter().map(|id| id.to_string()),
        ));
        let rows = self
            .store
            .select(STUDENT_CONSENTS, &query)
            .await
            .map_err(LedgerError::from)
            .inspect_err(|e| error!(error = %e, "failed to load consents"))?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let record: ConsentRecord = from_row(row)?;
            if caller.can_view(&record) {
                out.insert(record.student_id, record);
            }
        }
        Ok(out)
    }

    /// Paginated admin listing, newest change first. `page` is 1-based.
    ///
    /// Non-staff callers receive an empty page.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn get_all_consents(
        &self,
        caller: &Caller,
        page: usize,
        per_page: usize,
    ) -> Result<Page<ConsentView>, LedgerError> {
        let page = page.max(1);
        let per_page = per_page.clamp(1, MAX_PAGE_SIZE);
        if !caller.role.is_staff() {
            debug!("consent listing hidden from non-staff caller");
            return Ok(Page::empty(page, per_page));
        }

        // A page past `usize::MAX` rows skips everything.
        let offset = (page - 1).checked_mul(per_page).unwrap_or(usize::MAX);
        let query = Query::new()
            .order_by("updated_at", true)
            .range(offset, per_page);
        let (total, rows) = tokio::try_join!(
            self.store.count(STUDENT_CONSENTS, &[]),
            self.store.select(STUDENT_CONSENTS, &query),
        )
        .map_err(LedgerError::from)
        .inspect_err(|e| error!(error = %e, "failed to list consents"))?;

        let records = rows
            .into_iter()
            .map(from_row::<ConsentRecord>)
            .collect::<Result<Vec<_>, _>>()?;

        let ids: HashSet<Uuid> = records
            .iter()
            .flat_map(|r| [Some(r.student_id), r.consented_by])
            .flatten()
            .collect();
        let names = self.display_names(&ids).await;

        let items = records
            .into_iter()
            .map(|record| ConsentView {
                student_name: names.get(&record.student_id).cloned(),
                consenter_name: record.consented_by.and_then(|id| names.get(&id).cloned()),
                record,
            })
            .collect();

        Ok(Page {
            items,
            page,
            per_page,
            total: total as usize,
        })
    }

    /// Aggregate counts, recomputed from the tables on every call.
    #[instrument(skip(self))]
    pub async fn get_consent_stats(&self) -> Result<ConsentStats, LedgerError> {
        let active = [Filter::eq("consent_given", true), Filter::eq("withdrawn", false)];
        let withdrawn = [Filter::eq("withdrawn", true)];
        let students = [Filter::eq("role", Role::Student.as_str())];

        let (total_students, consented, withdrawn) = tokio::try_join!(
            self.store.count(PROFILES, &students),
            self.store.count(STUDENT_CONSENTS, &active),
            self.store.count(STUDENT_CONSENTS, &withdrawn),
        )
        .map_err(LedgerError::from)
        .inspect_err(|e| error!(error = %e, "failed to compute consent stats"))?;

        Ok(ConsentStats::from_counts(total_students, consented, withdrawn))
    }

    /// The student's consent history, oldest first.
    ///
    /// Empty when the caller may not see the student's consent.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn consent_history(
        &self,
        caller: &Caller,
        student_id: Uuid,
    ) -> Result<Vec<ConsentEvent>, LedgerError> {
        if !caller.can_view_subject(student_id) {
            let visible = self
                .find_record(student_id)
                .await?
                .is_some_and(|r| caller.can_view(&r));
            if !visible {
                return Ok(Vec::new());
            }
        }
        let query = Query::new()
            .filter(Filter::eq("student_id", student_id.to_string()))
            .order_by("at", false);
        let rows = self
            .store
            .select(CONSENT_EVENTS, &query)
            .await
            .map_err(LedgerError::from)
            .inspect_err(|e| error!(error = %e, "failed to load consent history"))?;
        rows.into_iter().map(from_row).collect()
    }

    /// Whether `caller` may give consent for the student. Staff and the
    /// student always may; anyone else only when no record exists yet or they
    /// gave the existing one.
    #[instrument(skip(self, caller), fields(caller = %caller.user_id))]
    pub async fn may_give_consent(
        &self,
        caller: &Caller,
        student_id: Uuid,
    ) -> Result<bool, LedgerError> {
        if caller.can_view_subject(student_id) {
            return Ok(true);
        }
        let existing = self
            .find_record(student_id)
            .await
            .inspect_err(|e| error!(error = %e, "failed to load consent"))?;
        Ok(caller.can_give(student_id, existing.as_ref()))
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Record consent. Creates the row on first consent; otherwise updates it
    /// in place, clearing any withdrawal.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Persistence`] when the write failed: consent was NOT
    /// recorded and the caller must not assume otherwise.
    #[instrument(skip(self, request), fields(student_id = %request.student_id))]
    pub async fn give_consent(&self, request: GiveConsent) -> Result<ConsentRecord, LedgerError> {
        self.record_consent(request)
            .await
            .inspect_err(|e| error!(error = %e, "failed to record consent"))
    }

    async fn record_consent(&self, request: GiveConsent) -> Result<ConsentRecord, LedgerError> {
        let now = self.clock.now();
        let ip_address = match request.ip_address {
            Some(ip) => Some(ip),
            None => self.lookup_ip().await,
        };

        let patch = to_row(&json!({
            "consent_given": true,
            "consent_text": self.consent_text,
            "consent_date": now,
            "consented_by": request.consented_by,
            "ip_address": ip_address,
            "user_agent": request.user_agent,
            "withdrawn": false,
            "withdrawn_date": null,
            "withdrawn_reason": null,
            "updated_at": now,
        }))?;

        let record = match self.find_record(request.student_id).await? {
            None => {
                let record = ConsentRecord {
                    id: Uuid::new_v4(),
                    student_id: request.student_id,
                    consent_given: true,
                    consent_text: Some(self.consent_text.clone()),
                    consent_date: Some(now),
                    consented_by: Some(request.consented_by),
                    ip_address: ip_address.clone(),
                    user_agent: request.user_agent.clone(),
                    withdrawn: false,
                    withdrawn_date: None,
                    withdrawn_reason: None,
                    created_at: now,
                    updated_at: now,
                };
                match self.store.insert(STUDENT_CONSENTS, to_row(&record)?).await {
                    Ok(row) => from_row(row)?,
                    // Another give created the row since our read.
                    Err(StoreError::Constraint(e)) => {
                        debug!(error = %e, "consent row already exists, updating instead");
                        self.update_record(request.student_id, patch).await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Some(_) => self.update_record(request.student_id, patch).await?,
        };

        self.append_event(ConsentEvent {
            id: Uuid::new_v4(),
            student_id: record.student_id,
            action: ConsentAction::Given,
            at: now,
            actor: Some(request.consented_by),
            ip_address,
            user_agent: request.user_agent,
            reason: None,
            consent_text: Some(self.consent_text.clone()),
        })
        .await;

        info!("consent given");
        Ok(record)
    }

    /// Withdraw the student's current consent, keeping the row.
    ///
    /// # Errors
    ///
    /// [`LedgerError::NoConsentRecord`] if consent was never given,
    /// [`LedgerError::AlreadyWithdrawn`] if it is already withdrawn, and
    /// [`LedgerError::Persistence`] if the write failed.
    #[instrument(skip(self, reason))]
    pub async fn withdraw_consent(
        &self,
        student_id: Uuid,
        reason: Option<&str>,
        withdrawn_by: Option<Uuid>,
    ) -> Result<ConsentRecord, LedgerError> {
        self.record_withdrawal(student_id, reason, withdrawn_by)
            .await
            .inspect_err(|e| warn!(error = %e, "consent withdrawal not recorded"))
    }

    async fn record_withdrawal(
        &self,
        student_id: Uuid,
        reason: Option<&str>,
        withdrawn_by: Option<Uuid>,
    ) -> Result<ConsentRecord, LedgerError> {
        let existing = self
            .find_record(student_id)
            .await?
            .ok_or(LedgerError::NoConsentRecord(student_id))?;
        if existing.withdrawn {
            return Err(LedgerError::AlreadyWithdrawn(student_id));
        }

        let now = self.clock.now();
        let reason = reason.map(str::trim).filter(|r| !r.is_empty()).map(str::to_owned);
        let patch = to_row(&json!({
            "consent_given": false,
            "withdrawn": true,
            "withdrawn_date": now,
            "withdrawn_reason": reason,
            "updated_at": now,
        }))?;
        let record = self.update_record(student_id, patch).await?;

        self.append_event(ConsentEvent {
            id: Uuid::new_v4(),
            student_id,
            action: ConsentAction::Withdrawn,
            at: now,
            actor: withdrawn_by,
            ip_address: None,
            user_agent: None,
            reason,
            consent_text: None,
        })
        .await;

        info!("consent withdrawn");
        Ok(record)
    }

    /// Remove the student's consent row and history as part of full erasure.
    /// Returns the number of rows removed.
    #[instrument(skip(self))]
    pub async fn erase_subject_consent(&self, student_id: Uuid) -> Result<u64, LedgerError> {
        let by_student = [Filter::eq("student_id", student_id.to_string())];
        let removed = self.store.delete(STUDENT_CONSENTS, &by_student).await?
            + self.store.delete(CONSENT_EVENTS, &by_student).await?;
        info!(removed, "consent data erased");
        Ok(removed)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn find_record(&self, student_id: Uuid) -> Result<Option<ConsentRecord>, LedgerError> {
        let query = Query::new().filter(Filter::eq("student_id", student_id.to_string()));
        let rows = self.store.select(STUDENT_CONSENTS, &query).await?;
        rows.into_iter().next().map(from_row).transpose()
    }

    async fn update_record(&self, student_id: Uuid, patch: Row) -> Result<ConsentRecord, LedgerError> {
        let filter = [Filter::eq("student_id", student_id.to_string())];
        let rows = self.store.update(STUDENT_CONSENTS, &filter, patch).await?;
        // The row vanished between read and write (concurrent erasure).
        let row = rows
            .into_iter()
            .next()
            .ok_or(LedgerError::NoConsentRecord(student_id))?;
        from_row(row)
    }

    async fn append_event(&self, event: ConsentEvent) {
        let row = match to_row(&event) {
            Ok(row) => row,
            Err(e) => {
                error!(error = %e, "failed to encode consent event");
                return;
            }
        };
        if let Err(e) = self.store.insert(CONSENT_EVENTS, row).await {
            error!(error = %e, action = ?event.action, "consent history append failed");
        }
    }

    async fn lookup_ip(&self) -> Option<String> {
        let lookup = self.ip_lookup.as_ref()?;
        lookup.lookup().await.map(|ip| ip.to_string())
    }

    /// Decrypted `full_name` of a profile; `None` if absent or unreadable.
    async fn display_name(&self, profile_id: Option<Uuid>) -> Option<String> {
        let id = profile_id?;
        let query = Query::new().filter(Filter::eq("id", id.to_string()));
        match self.store.select(PROFILES, &query).await {
            Ok(rows) => rows.into_iter().next().and_then(|row| self.name_from_row(row)),
            Err(e) => {
                warn!(error = %e, "failed to load profile for display name");
                None
            }
        }
    }

    async fn display_names(&self, ids: &HashSet<Uuid>) -> HashMap<Uuid, String> {
        if ids.is_empty() {
            return HashMap::new();
        }
        let query = Query::new().filter(Filter::is_in("id", ids.iter().map(Uuid::to_string)));
        match self.store.select(PROFILES, &query).await {
            Ok(rows) => rows
                .into_iter()
                .filter_map(|row| {
                    let id = row.get("id")?.as_str()?.parse::<Uuid>().ok()?;
                    Some((id, self.name_from_row(row)?))
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to load profiles for display names");
                HashMap::new()
            }
        }
    }

    fn name_from_row(&self, row: Row) -> Option<String> {
        let profile: Profile = match serde_json::from_value(Value::Object(row)) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "profile row is malformed");
                return None;
            }
        };
        self.codec.decrypt_profile_fields(&profile).full_name
    }
}

fn to_row<T: Serialize>(value: &T) -> Result<Row, LedgerError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(row)) => Ok(row),
        Ok(_) => Err(LedgerError::CorruptRecord("value is not an object".into())),
        Err(e) => Err(LedgerError::CorruptRecord(e.to_string())),
    }
}

fn from_row<T: DeserializeOwned>(row: Row) -> Result<T, LedgerError> {
    serde_json::from_value(Value::Object(row)).map_err(|e| LedgerError::CorruptRecord(e.to_string()))
}
