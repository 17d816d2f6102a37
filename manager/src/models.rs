use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Opaque caller-supplied payload, passed through to stage collaborators unmodified.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Number of orchestrated pipeline steps. Fixed by the pipeline shape.
pub const TOTAL_STEPS: u32 = 4;

/// Maximum number of prepare-after-failure retries before a new id is derived.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Prepared,
    InProgress,
    Completed,
    Failed,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Prepared => "prepared",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionError {
    pub message: String,
    pub timestamp: i64,
}

impl SessionError {
    pub fn new(message: String) -> Self {
        Self {
            message,
            timestamp: Utc::now().timestamp(),
        }
    }
}

/// One logical unit of generation work, identified by an opaque string key.
/// Reusable across attempts; the fine-grained execution record lives in
/// `GenerationRun`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub metadata: Metadata,
    pub vcs_analysis_text: Option<String>,
    pub source_file_reference: Option<String>,
    pub ttl_seconds: i64,
    pub reusable: bool,
    pub usage_count: u32,
    pub retry_count: u32,
    pub last_error: Option<SessionError>,
    pub previous_errors: Vec<SessionError>,
}

impl Session {
    pub fn new(
        id: String,
        metadata: Metadata,
        source_file_reference: Option<String>,
        vcs_analysis_text: Option<String>,
        ttl_seconds: i64,
    ) -> Self {
        Self {
            id,
            status: SessionStatus::Prepared,
            created_at: Utc::now().timestamp(),
            completed_at: None,
            failed_at: None,
            metadata,
            vcs_analysis_text,
            source_file_reference,
            ttl_seconds,
            reusable: true,
            usage_count: 0,
            retry_count: 0,
            last_error: None,
            previous_errors: Vec::new(),
        }
    }

    /// Age-based expiry check. InProgress sessions are exempted by callers,
    /// not here.
    pub fn is_expired(&self, now: i64) -> bool {
        now - self.created_at > self.ttl_seconds
    }

    pub fn mark_in_progress(&mut self) {
        self.status = SessionStatus::InProgress;
    }

    pub fn mark_completed(&mut self) {
        self.status = SessionStatus::Completed;
        self.completed_at = Some(Utc::now().timestamp());
    }

    pub fn mark_failed(&mut self, message: String) {
        self.status = SessionStatus::Failed;
        self.failed_at = Some(Utc::now().timestamp());
        self.last_error = Some(SessionError::new(message));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Received,
    AnalyzingVcs,
    GeneratingScenarios,
    GeneratingDocuments,
    Completed,
    Error,
}

/// One concrete execution attempt of the staged pipeline for a session.
/// Mutated only by the orchestrator task that owns the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRun {
    pub session_id: String,
    pub status: RunStatus,
    pub steps_completed: u32,
    pub total_steps: u32,
    pub current_step: String,
    /// Artifact name -> generated filename, populated incrementally.
    pub results: HashMap<String, String>,
    /// Isolated stage failures. Non-fatal unless the failing stage was sequential.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub started_at: i64,
    pub completed_at: Option<i64>,
}

impl GenerationRun {
    pub fn new(session_id: String) -> Self {
        Self {
            session_id,
            status: RunStatus::Received,
            steps_completed: 0,
            total_steps: TOTAL_STEPS,
            current_step: "Request received".to_string(),
            results: HashMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            started_at: Utc::now().timestamp(),
            completed_at: None,
        }
    }

    pub fn advance(&mut self, status: RunStatus, steps_completed: u32, step_label: &str) {
        self.status = status;
        self.steps_completed = steps_completed;
        self.current_step = step_label.to_string();
    }

    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.steps_completed = self.total_steps;
        self.current_step = "Completed".to_string();
        self.completed_at = Some(Utc::now().timestamp());
    }

    pub fn fail(&mut self, step_label: &str) {
        self.status = RunStatus::Error;
        self.current_step = step_label.to_string();
        self.completed_at = Some(Utc::now().timestamp());
    }

    /// Coarse percent for status pushes and the snapshot endpoint. An errored
    /// run reports the percent of its last completed step.
    pub fn progress(&self) -> u8 {
        match self.status {
            RunStatus::Received => 25,
            RunStatus::AnalyzingVcs => 50,
            RunStatus::GeneratingScenarios => 75,
            RunStatus::GeneratingDocuments => 90,
            RunStatus::Completed => 100,
            RunStatus::Error => (self.steps_completed * 25).min(100) as u8,
        }
    }
}

/// Final payload carried on the terminal Completed progress message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub results: HashMap<String, String>,
    pub elapsed_seconds: i64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Ephemeral status push. Never stored; the run snapshot is the durable view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub session_id: String,
    pub status: RunStatus,
    pub message: String,
    pub progress: u8,
    pub current_step: String,
    pub steps_completed: u32,
    pub total_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
}

impl ProgressMessage {
    /// Snapshot of a run at one transition, without a terminal payload.
    pub fn from_run(run: &GenerationRun, message: String) -> Self {
        Self {
            session_id: run.session_id.clone(),
            status: run.status,
            message,
            progress: run.progress(),
            current_step: run.current_step.clone(),
            steps_completed: run.steps_completed,
            total_steps: run.total_steps,
            details: None,
            result: None,
        }
    }

    /// Welcome push sent when a progress connection binds.
    pub fn welcome(session_id: String) -> Self {
        Self {
            session_id,
            status: RunStatus::Received,
            message: "Progress channel connected".to_string(),
            progress: 0,
            current_step: "Connected".to_string(),
            steps_completed: 0,
            total_steps: TOTAL_STEPS,
            details: None,
            result: None,
        }
    }
}

/// One generated test scenario, as parsed from the scenario-generation
/// collaborator and handed to the document builders.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestScenario {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub preconditions: Vec<String>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub expected: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioSet {
    pub scenarios: Vec<TestScenario>,
}

// ---------------------------------------------------------------------------
// Request / response DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareOutcome {
    Created,
    Reused,
    Retry,
    Recycled,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PrepareSessionRequest {
    pub session_id: Option<String>,
    pub metadata: Option<Metadata>,
    pub source_file_reference: Option<String>,
    pub vcs_analysis_text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PrepareSessionResponse {
    pub session_id: String,
    pub status: PrepareOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartGenerationRequest {
    pub session_id: String,
    pub vcs_analysis_text: String,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartGenerationResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitSessionResponse {
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerationStatusResponse {
    pub session_id: String,
    pub status: RunStatus,
    pub current_step: String,
    pub steps_completed: u32,
    pub total_steps: u32,
    pub progress: u8,
    pub results: HashMap<String, String>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl From<&GenerationRun> for GenerationStatusResponse {
    fn from(run: &GenerationRun) -> Self {
        Self {
            session_id: run.session_id.clone(),
            status: run.status,
            current_step: run.current_step.clone(),
            steps_completed: run.steps_completed,
            total_steps: run.total_steps,
            progress: run.progress(),
            results: run.results.clone(),
            errors: run.errors.clone(),
            warnings: run.warnings.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
    pub retry_count: u32,
    pub usage_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<SessionError>,
    pub previous_errors: Vec<SessionError>,
}

impl From<&Session> for SessionStatusResponse {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            status: session.status,
            created_at: session.created_at,
            completed_at: session.completed_at,
            failed_at: session.failed_at,
            retry_count: session.retry_count,
            usage_count: session.usage_count,
            last_error: session.last_error.clone(),
            previous_errors: session.previous_errors.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionStatsResponse {
    pub total_sessions: usize,
    pub status_counts: HashMap<String, usize>,
    pub sweep_running: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerStatus {
    pub status: String,
    pub version: String,
    pub uptime: u64,
}
