use crate::config::CollaboratorConfig;
use crate::models::{Metadata, ScenarioSet};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Analyzes raw VCS diff text into a structured change summary.
#[async_trait]
pub trait VcsAnalyzer: Send + Sync {
    async fn analyze(&self, vcs_text: &str, metadata: &Metadata) -> Result<String>;
}

/// Turns a change analysis into a set of test scenarios (LLM call + parser).
#[async_trait]
pub trait ScenarioGenerator: Send + Sync {
    async fn generate(&self, analysis: &str, metadata: &Metadata) -> Result<ScenarioSet>;
}

/// Renders one document artifact from the scenario set, returning its filename.
#[async_trait]
pub trait DocumentBuilder: Send + Sync {
    /// Key under which the artifact is recorded in the run results.
    fn artifact_name(&self) -> &'static str;

    async fn build(&self, scenarios: &ScenarioSet, metadata: &Metadata) -> Result<String>;
}

/// The full set of stage collaborators the orchestrator drives. The three
/// builders are the fan-out group; their failures are isolated per branch.
pub struct Collaborators {
    pub vcs_analyzer: Arc<dyn VcsAnalyzer>,
    pub scenario_generator: Arc<dyn ScenarioGenerator>,
    pub word_builder: Arc<dyn DocumentBuilder>,
    pub excel_list_builder: Arc<dyn DocumentBuilder>,
    pub integrated_scenario_builder: Arc<dyn DocumentBuilder>,
}

impl Collaborators {
    /// Production wiring: every stage is a remote HTTP service under one base
    /// URL, called with a shared per-request timeout.
    pub fn http(config: &CollaboratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to build collaborator HTTP client")?;

        let base_url = config.base_url.trim_end_matches('/').to_string();

        Ok(Self {
            vcs_analyzer: Arc::new(HttpVcsAnalyzer {
                client: client.clone(),
                url: format!("{base_url}/analyze-vcs"),
            }),
            scenario_generator: Arc::new(HttpScenarioGenerator {
                client: client.clone(),
                url: format!("{base_url}/generate-scenarios"),
            }),
            word_builder: Arc::new(HttpDocumentBuilder {
                client: client.clone(),
                url: format!("{base_url}/build/word"),
                artifact: "word",
                output_dir: config.output_dir.clone(),
            }),
            excel_list_builder: Arc::new(HttpDocumentBuilder {
                client: client.clone(),
                url: format!("{base_url}/build/change-list"),
                artifact: "excelList",
                output_dir: config.output_dir.clone(),
            }),
            integrated_scenario_builder: Arc::new(HttpDocumentBuilder {
                client,
                url: format!("{base_url}/build/integrated-scenario"),
                artifact: "integratedScenario",
                output_dir: config.output_dir.clone(),
            }),
        })
    }
}

#[derive(Serialize)]
struct AnalyzeVcsRequest<'a> {
    vcs_analysis_text: &'a str,
    metadata: &'a Metadata,
}

#[derive(Deserialize)]
struct AnalyzeVcsResponse {
    analysis: String,
}

struct HttpVcsAnalyzer {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl VcsAnalyzer for HttpVcsAnalyzer {
    async fn analyze(&self, vcs_text: &str, metadata: &Metadata) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&AnalyzeVcsRequest {
                vcs_analysis_text: vcs_text,
                metadata,
            })
            .send()
            .await
            .context("VCS analyzer request failed")?
            .error_for_status()
            .context("VCS analyzer returned an error status")?;

        let body: AnalyzeVcsResponse = response
            .json()
            .await
            .context("Failed to parse VCS analyzer response")?;
        Ok(body.analysis)
    }
}

#[derive(Serialize)]
struct GenerateScenariosRequest<'a> {
    analysis: &'a str,
    metadata: &'a Metadata,
}

struct HttpScenarioGenerator {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl ScenarioGenerator for HttpScenarioGenerator {
    async fn generate(&self, analysis: &str, metadata: &Metadata) -> Result<ScenarioSet> {
        let response = self
            .client
            .post(&self.url)
            .json(&GenerateScenariosRequest { analysis, metadata })
            .send()
            .await
            .context("Scenario generator request failed")?
            .error_for_status()
            .context("Scenario generator returned an error status")?;

        let scenarios: ScenarioSet = response
            .json()
            .await
            .context("Failed to parse scenario generator response")?;
        Ok(scenarios)
    }
}

#[derive(Serialize)]
struct BuildDocumentRequest<'a> {
    scenarios: &'a ScenarioSet,
    metadata: &'a Metadata,
    output_dir: &'a PathBuf,
}

#[derive(Deserialize)]
struct BuildDocumentResponse {
    filename: String,
}

struct HttpDocumentBuilder {
    client: reqwest::Client,
    url: String,
    artifact: &'static str,
    output_dir: PathBuf,
}

#[async_trait]
impl DocumentBuilder for HttpDocumentBuilder {
    fn artifact_name(&self) -> &'static str {
        self.artifact
    }

    async fn build(&self, scenarios: &ScenarioSet, metadata: &Metadata) -> Result<String> {
        let response = self
            .client
            .post(&self.url)
            .json(&BuildDocumentRequest {
                scenarios,
                metadata,
                output_dir: &self.output_dir,
            })
            .send()
            .await
            .with_context(|| format!("{} builder request failed", self.artifact))?
            .error_for_status()
            .with_context(|| format!("{} builder returned an error status", self.artifact))?;

        let body: BuildDocumentResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} builder response", self.artifact))?;
        Ok(body.filename)
    }
}
