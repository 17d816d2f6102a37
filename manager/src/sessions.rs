use crate::error::{AppError, AppResult};
use crate::models::{
    Metadata, PrepareOutcome, PrepareSessionRequest, PrepareSessionResponse, Session,
    SessionStatsResponse, SessionStatus, SessionStatusResponse, MAX_RETRIES,
};
use crate::store::SessionStore;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Encodes the reuse / retry / recycle policy over the session table and
/// owns the periodic expiry sweep.
pub struct SessionManager {
    store: Arc<SessionStore>,
    ttl_seconds: i64,
}

impl SessionManager {
    pub fn new(store: Arc<SessionStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    /// Reconciles a prepare request against the stored session for the given
    /// id, if any. Terminal states resolve to reuse (Completed), retry
    /// (Failed under the cap), a derived fresh id (Failed at the cap) or an
    /// in-place recycle (Expired). An InProgress session is a conflict.
    pub fn prepare(&self, req: PrepareSessionRequest) -> AppResult<PrepareSessionResponse> {
        let metadata = req.metadata.unwrap_or_default();
        let requested_id = req
            .session_id
            .filter(|id| !id.trim().is_empty());

        let id = match requested_id {
            Some(id) => id,
            None => generate_session_id(),
        };
        let now = Utc::now().timestamp();
        let ttl_seconds = self.ttl_seconds;

        // The whole decision runs against the session table in one critical
        // section: a concurrent begin_run or prepare must not interleave
        // between the read and the write-back, or a stale Prepared status
        // could overwrite a live InProgress one. The entry is taken out,
        // decided on by value and put back before the lock is released.
        self.store.with_sessions_table(|sessions| {
            let Some(mut session) = sessions.remove(&id) else {
                sessions.insert(
                    id.clone(),
                    Session::new(
                        id.clone(),
                        metadata,
                        req.source_file_reference,
                        req.vcs_analysis_text,
                        ttl_seconds,
                    ),
                );
                tracing::info!(session_id = %id, "Created new session");
                return Ok(created_response(id));
            };

            // Re-evaluate TTL before applying any terminal-state policy.
            if session.status != SessionStatus::InProgress && session.is_expired(now) {
                session.status = SessionStatus::Expired;
            }

            match session.status {
                SessionStatus::InProgress => {
                    sessions.insert(id.clone(), session);
                    Err(AppError::SessionConflict(format!(
                        "Session {id} is in progress; wait for the current run to finish"
                    )))
                }

                SessionStatus::Completed if session.reusable => {
                    session.metadata = metadata;
                    session.vcs_analysis_text = req.vcs_analysis_text;
                    session.source_file_reference = req.source_file_reference;
                    session.status = SessionStatus::Prepared;
                    session.completed_at = None;
                    session.usage_count += 1;
                    let usage_count = session.usage_count;
                    sessions.insert(id.clone(), session);
                    tracing::info!(session_id = %id, usage_count, "Reusing completed session");
                    Ok(PrepareSessionResponse {
                        session_id: id,
                        status: PrepareOutcome::Reused,
                        retry_attempt: None,
                        max_retries: None,
                        message: format!("Session reused (usage {usage_count})"),
                    })
                }

                SessionStatus::Failed if session.retry_count < MAX_RETRIES => {
                    if let Some(last) = session.last_error.take() {
                        session.previous_errors.push(last);
                    }
                    session.metadata = metadata;
                    session.vcs_analysis_text = req.vcs_analysis_text;
                    session.source_file_reference = req.source_file_reference;
                    session.status = SessionStatus::Prepared;
                    session.failed_at = None;
                    session.retry_count += 1;
                    let attempt = session.retry_count;
                    sessions.insert(id.clone(), session);
                    tracing::info!(session_id = %id, attempt, "Retrying failed session");
                    Ok(PrepareSessionResponse {
                        session_id: id,
                        status: PrepareOutcome::Retry,
                        retry_attempt: Some(attempt),
                        max_retries: Some(MAX_RETRIES),
                        message: format!("Retry attempt {attempt} of {MAX_RETRIES}"),
                    })
                }

                // Retry budget exhausted, or a completed session marked not
                // reusable: derive a fresh id and leave the old record
                // untouched for inspection.
                SessionStatus::Failed | SessionStatus::Completed => {
                    sessions.insert(id.clone(), session);
                    let new_id = format!("{id}_new_{now}");
                    sessions.insert(
                        new_id.clone(),
                        Session::new(
                            new_id.clone(),
                            metadata,
                            req.source_file_reference,
                            req.vcs_analysis_text,
                            ttl_seconds,
                        ),
                    );
                    tracing::info!(
                        session_id = %new_id,
                        previous_id = %id,
                        "Derived fresh session id"
                    );
                    Ok(created_response(new_id))
                }

                SessionStatus::Expired => {
                    sessions.insert(
                        id.clone(),
                        Session::new(
                            id.clone(),
                            metadata,
                            req.source_file_reference,
                            req.vcs_analysis_text,
                            ttl_seconds,
                        ),
                    );
                    tracing::info!(session_id = %id, "Recycled expired session");
                    Ok(PrepareSessionResponse {
                        session_id: id,
                        status: PrepareOutcome::Recycled,
                        retry_attempt: None,
                        max_retries: None,
                        message: "Expired session reinitialized".to_string(),
                    })
                }

                // A still-Prepared session: overwrite the request payload in
                // place.
                SessionStatus::Prepared => {
                    session.metadata = metadata;
                    session.vcs_analysis_text = req.vcs_analysis_text;
                    session.source_file_reference = req.source_file_reference;
                    sessions.insert(id.clone(), session);
                    Ok(created_response(id))
                }
            }
        })?
    }

    /// Idempotent pre-registration used before a progress connection is
    /// opened. Returns whether the session already existed.
    pub fn init(&self, id: &str) -> AppResult<bool> {
        if id.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "Session id cannot be empty".to_string(),
            ));
        }
        let ttl_seconds = self.ttl_seconds;
        self.store.with_sessions_table(|sessions| {
            if sessions.contains_key(id) {
                return true;
            }
            sessions.insert(
                id.to_string(),
                Session::new(id.to_string(), Metadata::new(), None, None, ttl_seconds),
            );
            tracing::info!(session_id = %id, "Initialized session for progress channel");
            false
        })
    }

    /// Stored metadata for a session. An over-age session is flipped to
    /// Expired as a side effect and reported gone rather than returned stale.
    pub fn get_metadata(&self, id: &str) -> AppResult<Metadata> {
        let session = self
            .store
            .get_session(id)?
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;

        if session.status != SessionStatus::InProgress
            && session.is_expired(Utc::now().timestamp())
        {
            self.store
                .with_session_mut(id, |s| s.status = SessionStatus::Expired)?;
            return Err(AppError::SessionGone(id.to_string()));
        }
        Ok(session.metadata)
    }

    /// Full session snapshot, with the same flip-on-read expiry side effect.
    pub fn get_status(&self, id: &str) -> AppResult<SessionStatusResponse> {
        let mut session = self
            .store
            .get_session(id)?
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;

        if session.status != SessionStatus::InProgress
            && session.is_expired(Utc::now().timestamp())
        {
            self.store
                .with_session_mut(id, |s| s.status = SessionStatus::Expired)?;
            session.status = SessionStatus::Expired;
        }
        Ok(SessionStatusResponse::from(&session))
    }

    pub fn delete(&self, id: &str) -> AppResult<()> {
        self.store
            .remove_session(id)?
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;
        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }

    pub fn statistics(&self) -> AppResult<SessionStatsResponse> {
        Ok(SessionStatsResponse {
            total_sessions: self.store.session_count()?,
            status_counts: self.store.status_counts()?,
            sweep_running: self.store.is_sweep_running(),
        })
    }

    /// Spawns the periodic expiry sweep. The returned handle is owned by the
    /// caller and aborted on shutdown.
    pub fn spawn_sweep(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        store.set_sweep_running(true);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so a fresh process
            // does not sweep an empty table.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.remove_expired(Utc::now().timestamp()) {
                    Ok(removed) if !removed.is_empty() => {
                        tracing::info!(count = removed.len(), "Expiry sweep removed sessions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("Expiry sweep failed: {e}"),
                }
            }
        })
    }
}

fn created_response(session_id: String) -> PrepareSessionResponse {
    PrepareSessionResponse {
        session_id,
        status: PrepareOutcome::Created,
        retry_attempt: None,
        max_retries: None,
        message: "Session prepared".to_string(),
    }
}

/// Generated session ids look like `session_20240101120000_a1b2c3d4`.
fn generate_session_id() -> String {
    let hex: u32 = rand::rng().random();
    format!(
        "session_{}_{hex:08x}",
        Utc::now().format("%Y%m%d%H%M%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PrepareOutcome;

    fn manager() -> (Arc<SessionStore>, SessionManager) {
        let store = Arc::new(SessionStore::new());
        let manager = SessionManager::new(Arc::clone(&store), 3600);
        (store, manager)
    }

    fn prepare_req(id: Option<&str>) -> PrepareSessionRequest {
        PrepareSessionRequest {
            session_id: id.map(|s| s.to_string()),
            metadata: None,
            source_file_reference: None,
            vcs_analysis_text: None,
        }
    }

    #[test]
    fn prepare_without_id_generates_one() {
        let (store, manager) = manager();
        let resp = manager.prepare(prepare_req(None)).unwrap();
        assert_eq!(resp.status, PrepareOutcome::Created);
        assert!(resp.session_id.starts_with("session_"));
        assert!(store.get_session(&resp.session_id).unwrap().is_some());
    }

    #[test]
    fn prepare_reuses_completed_session_once_per_call() {
        let (store, manager) = manager();
        manager.prepare(prepare_req(Some("s1"))).unwrap();
        store
            .with_session_mut("s1", |s| s.mark_completed())
            .unwrap();

        let resp = manager.prepare(prepare_req(Some("s1"))).unwrap();
        assert_eq!(resp.status, PrepareOutcome::Reused);
        assert_eq!(resp.session_id, "s1");

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Prepared);
        assert_eq!(session.usage_count, 1);
    }

    #[test]
    fn racing_prepare_and_begin_run_admit_exactly_one_run() {
        use std::sync::Barrier;
        use std::thread;

        for _ in 0..500 {
            let store = Arc::new(SessionStore::new());
            let mut session = Session::new("s1".to_string(), Metadata::new(), None, None, 3600);
            session.mark_completed();
            store.insert_session(session).unwrap();

            let barrier = Arc::new(Barrier::new(2));
            let prepare_handle = {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let manager = SessionManager::new(store, 3600);
                    barrier.wait();
                    manager.prepare(prepare_req(Some("s1")))
                })
            };
            let run_handle = {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.begin_run("s1")
                })
            };

            let prepared = prepare_handle.join().unwrap();
            let begun = run_handle.join().unwrap();

            // Either begin_run claimed the completed session first and the
            // prepare saw the conflict, or the prepare reused it and
            // begin_run then claimed it. In both orderings one run is
            // admitted and the session ends InProgress: a stale prepare
            // write-back must never mask a live run.
            assert!(begun.is_ok());
            let session = store.get_session("s1").unwrap().unwrap();
            assert_eq!(session.status, SessionStatus::InProgress);
            assert!(matches!(
                store.begin_run("s1").unwrap_err(),
                AppError::SessionConflict(_)
            ));
            if let Err(e) = prepared {
                assert!(matches!(e, AppError::SessionConflict(_)));
            }
        }
    }

    #[test]
    fn prepare_conflicts_on_in_progress_session() {
        let (store, manager) = manager();
        manager.prepare(prepare_req(Some("s1"))).unwrap();
        store
            .with_session_mut("s1", |s| s.mark_in_progress())
            .unwrap();

        let err = manager.prepare(prepare_req(Some("s1"))).unwrap_err();
        assert!(matches!(err, AppError::SessionConflict(_)));
    }

    #[test]
    fn retry_is_capped_then_derives_a_new_id() {
        let (store, manager) = manager();
        manager.prepare(prepare_req(Some("s1"))).unwrap();

        for attempt in 1..=MAX_RETRIES {
            store
                .with_session_mut("s1", |s| s.mark_failed(format!("boom {attempt}")))
                .unwrap();
            let resp = manager.prepare(prepare_req(Some("s1"))).unwrap();
            assert_eq!(resp.status, PrepareOutcome::Retry);
            assert_eq!(resp.retry_attempt, Some(attempt));
            assert_eq!(resp.max_retries, Some(MAX_RETRIES));
        }

        // Fourth failure exhausts the budget: a fresh derived id is created
        // and the original record is left in its Failed state.
        store
            .with_session_mut("s1", |s| s.mark_failed("boom final".to_string()))
            .unwrap();
        let resp = manager.prepare(prepare_req(Some("s1"))).unwrap();
        assert_eq!(resp.status, PrepareOutcome::Created);
        assert_ne!(resp.session_id, "s1");
        assert!(resp.session_id.starts_with("s1_new_"));

        let original = store.get_session("s1").unwrap().unwrap();
        assert_eq!(original.status, SessionStatus::Failed);
        assert_eq!(original.retry_count, MAX_RETRIES);
    }

    #[test]
    fn retry_moves_last_error_into_history() {
        let (store, manager) = manager();
        manager.prepare(prepare_req(Some("s1"))).unwrap();
        store
            .with_session_mut("s1", |s| s.mark_failed("first failure".to_string()))
            .unwrap();
        manager.prepare(prepare_req(Some("s1"))).unwrap();

        let session = store.get_session("s1").unwrap().unwrap();
        assert!(session.last_error.is_none());
        assert_eq!(session.previous_errors.len(), 1);
        assert_eq!(session.previous_errors[0].message, "first failure");
    }

    #[test]
    fn expired_session_is_recycled_in_place() {
        let (store, manager) = manager();
        manager.prepare(prepare_req(Some("s1"))).unwrap();
        store
            .with_session_mut("s1", |s| {
                s.mark_completed();
                s.usage_count = 5;
                s.retry_count = 2;
                s.created_at -= 7200;
            })
            .unwrap();

        let resp = manager.prepare(prepare_req(Some("s1"))).unwrap();
        assert_eq!(resp.status, PrepareOutcome::Recycled);
        assert_eq!(resp.session_id, "s1");

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Prepared);
        assert_eq!(session.usage_count, 0);
        assert_eq!(session.retry_count, 0);
    }

    #[test]
    fn get_metadata_flips_expired_session_to_gone() {
        let (store, manager) = manager();
        manager.prepare(prepare_req(Some("s1"))).unwrap();
        store
            .with_session_mut("s1", |s| s.created_at -= 7200)
            .unwrap();

        let err = manager.get_metadata("s1").unwrap_err();
        assert!(matches!(err, AppError::SessionGone(_)));

        let session = store.get_session("s1").unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Expired);
    }

    #[test]
    fn get_metadata_unknown_session_is_not_found() {
        let (_store, manager) = manager();
        let err = manager.get_metadata("missing").unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
    }

    #[test]
    fn init_is_idempotent() {
        let (_store, manager) = manager();
        assert!(!manager.init("s1").unwrap());
        assert!(manager.init("s1").unwrap());
    }

    #[test]
    fn statistics_counts_by_status() {
        let (store, manager) = manager();
        manager.prepare(prepare_req(Some("a"))).unwrap();
        manager.prepare(prepare_req(Some("b"))).unwrap();
        store.with_session_mut("b", |s| s.mark_completed()).unwrap();

        let stats = manager.statistics().unwrap();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.status_counts.get("prepared"), Some(&1));
        assert_eq!(stats.status_counts.get("completed"), Some(&1));
        assert!(!stats.sweep_running);
    }
}
