use crate::error::{AppError, AppResult};
use crate::models::{GenerationRun, Session, SessionStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Process-lifetime keyed tables for sessions and generation runs.
///
/// Constructed once in `main` and passed as `Arc` to every component that
/// needs it. One mutex per table; a single entry is always read-modified-
/// written under the table lock, so entries stay independent.
pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    runs: Mutex<HashMap<String, GenerationRun>>,
    sweep_running: AtomicBool,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            runs: Mutex::new(HashMap::new()),
            sweep_running: AtomicBool::new(false),
        }
    }

    fn lock_sessions(&self) -> AppResult<MutexGuard<'_, HashMap<String, Session>>> {
        self.sessions
            .lock()
            .map_err(|e| AppError::Internal(format!("Session table lock poisoned: {e}")))
    }

    fn lock_runs(&self) -> AppResult<MutexGuard<'_, HashMap<String, GenerationRun>>> {
        self.runs
            .lock()
            .map_err(|e| AppError::Internal(format!("Run table lock poisoned: {e}")))
    }

    pub fn get_session(&self, id: &str) -> AppResult<Option<Session>> {
        Ok(self.lock_sessions()?.get(id).cloned())
    }

    pub fn insert_session(&self, session: Session) -> AppResult<()> {
        self.lock_sessions()?.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn remove_session(&self, id: &str) -> AppResult<Option<Session>> {
        let removed = self.lock_sessions()?.remove(id);
        if removed.is_some() {
            self.lock_runs()?.remove(id);
        }
        Ok(removed)
    }

    /// Atomically read-modify-write one session entry. Returns `None` when the
    /// id is unknown.
    pub fn with_session_mut<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut Session) -> R,
    ) -> AppResult<Option<R>> {
        let mut sessions = self.lock_sessions()?;
        Ok(sessions.get_mut(id).map(f))
    }

    /// Runs a closure against the whole session table in one critical
    /// section. For policies that must decide and write back without another
    /// writer interleaving between the read and the write.
    pub fn with_sessions_table<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Session>) -> R,
    ) -> AppResult<R> {
        let mut sessions = self.lock_sessions()?;
        Ok(f(&mut sessions))
    }

    pub fn session_count(&self) -> AppResult<usize> {
        Ok(self.lock_sessions()?.len())
    }

    pub fn status_counts(&self) -> AppResult<HashMap<String, usize>> {
        let sessions = self.lock_sessions()?;
        let mut counts: HashMap<String, usize> = HashMap::new();
        for session in sessions.values() {
            *counts.entry(session.status.as_str().to_string()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Admission control for "start generation": atomically flips the session
    /// to InProgress and registers a fresh run record. A session that is
    /// already InProgress yields a conflict and no second run.
    pub fn begin_run(&self, id: &str) -> AppResult<GenerationRun> {
        let mut sessions = self.lock_sessions()?;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;

        if session.status == SessionStatus::InProgress {
            return Err(AppError::SessionConflict(format!(
                "Session {id} already has a generation run in progress"
            )));
        }
        session.mark_in_progress();

        let run = GenerationRun::new(id.to_string());
        self.lock_runs()?.insert(id.to_string(), run.clone());
        Ok(run)
    }

    pub fn get_run(&self, session_id: &str) -> AppResult<Option<GenerationRun>> {
        Ok(self.lock_runs()?.get(session_id).cloned())
    }

    pub fn put_run(&self, run: GenerationRun) -> AppResult<()> {
        self.lock_runs()?.insert(run.session_id.clone(), run);
        Ok(())
    }

    pub fn set_sweep_running(&self, running: bool) {
        self.sweep_running.store(running, Ordering::SeqCst);
    }

    pub fn is_sweep_running(&self) -> bool {
        self.sweep_running.load(Ordering::SeqCst)
    }

    /// Removes every expired non-InProgress session, flipping its status to
    /// Expired first. InProgress sessions are never auto-expired.
    pub fn remove_expired(&self, now: i64) -> AppResult<Vec<String>> {
        let mut sessions = self.lock_sessions()?;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.status != SessionStatus::InProgress && s.is_expired(now))
            .map(|s| s.id.clone())
            .collect();

        for id in &expired {
            if let Some(session) = sessions.get_mut(id) {
                session.status = SessionStatus::Expired;
            }
            sessions.remove(id);
        }

        // Run records of swept sessions go with them, or the run table would
        // grow for the process lifetime.
        let mut runs = self.lock_runs()?;
        for id in &expired {
            runs.remove(id);
        }
        Ok(expired)
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Metadata;
    use chrono::Utc;

    fn test_session(id: &str, ttl: i64) -> Session {
        Session::new(id.to_string(), Metadata::new(), None, None, ttl)
    }

    #[test]
    fn begin_run_rejects_in_progress_session() {
        let store = SessionStore::new();
        store.insert_session(test_session("s1", 3600)).unwrap();

        store.begin_run("s1").unwrap();
        let err = store.begin_run("s1").unwrap_err();
        assert!(matches!(err, AppError::SessionConflict(_)));

        // Still exactly one run record
        assert!(store.get_run("s1").unwrap().is_some());
    }

    #[test]
    fn begin_run_unknown_session_is_not_found() {
        let store = SessionStore::new();
        let err = store.begin_run("missing").unwrap_err();
        assert!(matches!(err, AppError::SessionNotFound(_)));
        assert!(store.get_run("missing").unwrap().is_none());
    }

    #[test]
    fn remove_session_drops_its_run_record() {
        let store = SessionStore::new();
        store.insert_session(test_session("s1", 3600)).unwrap();
        store.begin_run("s1").unwrap();

        store.remove_session("s1").unwrap();
        assert!(store.get_session("s1").unwrap().is_none());
        assert!(store.get_run("s1").unwrap().is_none());
    }

    #[test]
    fn remove_expired_prunes_run_records() {
        let store = SessionStore::new();
        let mut stale = test_session("stale", 10);
        stale.created_at -= 100;
        store.insert_session(stale).unwrap();
        store.begin_run("stale").unwrap();
        store
            .with_session_mut("stale", |s| s.mark_completed())
            .unwrap();

        let removed = store.remove_expired(Utc::now().timestamp()).unwrap();
        assert_eq!(removed, vec!["stale".to_string()]);
        assert!(store.get_run("stale").unwrap().is_none());
    }

    #[test]
    fn remove_expired_spares_in_progress_sessions() {
        let store = SessionStore::new();
        let mut old = test_session("old", 10);
        old.created_at -= 100;
        store.insert_session(old).unwrap();

        let mut busy = test_session("busy", 10);
        busy.created_at -= 100;
        busy.mark_in_progress();
        store.insert_session(busy).unwrap();

        store.insert_session(test_session("fresh", 3600)).unwrap();

        let removed = store.remove_expired(Utc::now().timestamp()).unwrap();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(store.get_session("old").unwrap().is_none());
        assert!(store.get_session("busy").unwrap().is_some());
        assert!(store.get_session("fresh").unwrap().is_some());
    }
}
