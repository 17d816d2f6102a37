use crate::collaborators::{Collaborators, DocumentBuilder};
use crate::error::{AppError, AppResult};
use crate::models::{
    GenerationResult, GenerationRun, Metadata, ProgressMessage, RunStatus, ScenarioSet,
};
use crate::store::SessionStore;
use crate::websocket::ProgressSink;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Drives the staged generation pipeline for one session at a time per run:
/// two sequential stages whose failure is fatal, then a fan-out of three
/// document builders whose failures are isolated per branch.
pub struct GenerationOrchestrator {
    store: Arc<SessionStore>,
    collaborators: Arc<Collaborators>,
    notifier: Arc<dyn ProgressSink>,
    stage_timeout: Duration,
}

impl GenerationOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        collaborators: Arc<Collaborators>,
        notifier: Arc<dyn ProgressSink>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            store,
            collaborators,
            notifier,
            stage_timeout,
        }
    }

    /// Accepts a generation request and spawns the run as a detached
    /// background task. Rejects before any state mutation when the inputs are
    /// malformed, and with a conflict when the session is already InProgress.
    pub fn start(
        self: &Arc<Self>,
        session_id: String,
        vcs_analysis_text: String,
        metadata: Metadata,
    ) -> AppResult<GenerationRun> {
        if session_id.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "Session id cannot be empty".to_string(),
            ));
        }
        if vcs_analysis_text.trim().is_empty() {
            return Err(AppError::InvalidRequest(
                "VCS analysis text cannot be empty".to_string(),
            ));
        }

        // Admission control: atomic InProgress check-and-set plus run creation.
        let run = self.store.begin_run(&session_id)?;

        // Keep the accepted inputs on the session so later reads and retries
        // see what this run actually worked on.
        self.store.with_session_mut(&session_id, |session| {
            session.vcs_analysis_text = Some(vcs_analysis_text.clone());
            session.metadata = metadata.clone();
        })?;

        tracing::info!(session_id = %session_id, "Accepted full generation request");

        let orchestrator = Arc::clone(self);
        let task_run = run.clone();
        tokio::spawn(async move {
            orchestrator
                .execute(task_run, vcs_analysis_text, metadata)
                .await;
        });

        Ok(run)
    }

    /// The pipeline body. Owns the run record exclusively; every transition is
    /// written to the store before the progress push is attempted.
    async fn execute(&self, mut run: GenerationRun, vcs_analysis_text: String, metadata: Metadata) {
        let session_id = run.session_id.clone();

        if metadata.is_empty() {
            run.warnings
                .push("Metadata was empty; generating with defaults".to_string());
        }
        self.persist_and_emit(&run, "Generation request received")
            .await;

        // Step 2: VCS analysis (sequential, fatal on failure)
        run.advance(RunStatus::AnalyzingVcs, 1, "Analyzing VCS changes");
        self.persist_and_emit(&run, "Analyzing VCS changes").await;

        let analysis = match self
            .with_stage_timeout(
                self.collaborators
                    .vcs_analyzer
                    .analyze(&vcs_analysis_text, &metadata),
            )
            .await
        {
            Ok(analysis) => analysis,
            Err(message) => {
                self.fail_run(run, "VCS analysis", message).await;
                return;
            }
        };

        // Step 3: scenario generation (sequential, fatal on failure)
        run.advance(RunStatus::GeneratingScenarios, 2, "Generating test scenarios");
        self.persist_and_emit(&run, "Generating test scenarios")
            .await;

        let scenarios = match self
            .with_stage_timeout(
                self.collaborators
                    .scenario_generator
                    .generate(&analysis, &metadata),
            )
            .await
        {
            Ok(scenarios) => scenarios,
            Err(message) => {
                self.fail_run(run, "Scenario generation", message).await;
                return;
            }
        };
        tracing::info!(
            session_id = %session_id,
            scenario_count = scenarios.scenarios.len(),
            "Scenario generation completed"
        );

        // Step 4: document builders (concurrent fan-out, failures isolated)
        run.advance(RunStatus::GeneratingDocuments, 3, "Generating documents");
        self.persist_and_emit(&run, "Generating documents").await;

        let outcomes = {
            let c = &self.collaborators;
            let (word, excel_list, integrated) = tokio::join!(
                self.build_document(&c.word_builder, &scenarios, &metadata),
                self.build_document(&c.excel_list_builder, &scenarios, &metadata),
                self.build_document(&c.integrated_scenario_builder, &scenarios, &metadata),
            );
            [word, excel_list, integrated]
        };

        for outcome in outcomes {
            match outcome {
                Ok((artifact, filename)) => {
                    run.results.insert(artifact.to_string(), filename);
                }
                Err(message) => {
                    tracing::warn!(session_id = %session_id, %message, "Document builder failed");
                    run.errors.push(message);
                }
            }
        }

        // Step 5: terminal Completed state and payload
        run.complete();
        let elapsed_seconds = run.completed_at.unwrap_or(run.started_at) - run.started_at;
        let result = GenerationResult {
            results: run.results.clone(),
            elapsed_seconds,
            errors: run.errors.clone(),
            warnings: run.warnings.clone(),
        };

        if let Err(e) = self.store.put_run(run.clone()) {
            tracing::error!(session_id = %session_id, "Failed to persist run: {e}");
        }
        if let Err(e) = self
            .store
            .with_session_mut(&session_id, |session| session.mark_completed())
        {
            tracing::error!(session_id = %session_id, "Failed to update session: {e}");
        }

        let mut message = ProgressMessage::from_run(&run, "Generation completed".to_string());
        message.result = Some(result);
        let delivered = self.notifier.send_progress(message).await;
        tracing::info!(
            session_id = %session_id,
            elapsed_seconds,
            artifact_count = run.results.len(),
            error_count = run.errors.len(),
            delivered,
            "Full generation completed"
        );
    }

    /// Fatal-path teardown: durable run and session state are written before
    /// the terminal Error message is pushed.
    async fn fail_run(&self, mut run: GenerationRun, stage: &str, message: String) {
        let session_id = run.session_id.clone();
        let description = format!("{stage} failed: {message}");
        tracing::error!(session_id = %session_id, %description, "Generation run failed");

        run.errors.push(description.clone());
        run.fail(stage);

        if let Err(e) = self.store.put_run(run.clone()) {
            tracing::error!(session_id = %session_id, "Failed to persist run: {e}");
        }
        if let Err(e) = self.store.with_session_mut(&session_id, |session| {
            session.mark_failed(description.clone());
        }) {
            tracing::error!(session_id = %session_id, "Failed to update session: {e}");
        }

        let delivered = self
            .notifier
            .send_progress(ProgressMessage::from_run(&run, description))
            .await;
        tracing::debug!(session_id = %session_id, delivered, "Terminal error message sent");
    }

    async fn persist_and_emit(&self, run: &GenerationRun, message: &str) {
        if let Err(e) = self.store.put_run(run.clone()) {
            tracing::error!(session_id = %run.session_id, "Failed to persist run: {e}");
        }
        let delivered = self
            .notifier
            .send_progress(ProgressMessage::from_run(run, message.to_string()))
            .await;
        tracing::debug!(
            session_id = %run.session_id,
            status = ?run.status,
            steps_completed = run.steps_completed,
            delivered,
            "Progress transition"
        );
    }

    async fn with_stage_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<T>>,
    ) -> Result<T, String> {
        match timeout(self.stage_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(_) => Err(format!(
                "timed out after {}s",
                self.stage_timeout.as_secs()
            )),
        }
    }

    /// One fan-out branch. A failure is folded into a tagged error string
    /// instead of aborting the join.
    async fn build_document(
        &self,
        builder: &Arc<dyn DocumentBuilder>,
        scenarios: &ScenarioSet,
        metadata: &Metadata,
    ) -> Result<(&'static str, String), String> {
        let artifact = builder.artifact_name();
        self.with_stage_timeout(builder.build(scenarios, metadata))
            .await
            .map(|filename| (artifact, filename))
            .map_err(|message| format!("{artifact}: {message}"))
    }
}
