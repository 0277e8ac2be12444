use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::{CoordinatorError, Result};

/// Server-side job status lifecycle: Pending -> InProgress -> Complete/Failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    #[serde(alias = "processing")]
    InProgress,
    #[serde(alias = "completed")]
    Complete,
    #[serde(alias = "error")]
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_progress" | "processing" => Some(JobStatus::InProgress),
            "complete" | "completed" => Some(JobStatus::Complete),
            "failed" | "error" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }
}

/// Coarse sizing hint passed to the generator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobScale {
    #[serde(alias = "Small")]
    Small,
    #[default]
    #[serde(alias = "Medium")]
    Medium,
    #[serde(alias = "Large")]
    Large,
}

impl JobScale {
    pub fn as_str(&self) -> &str {
        match self {
            JobScale::Small => "small",
            JobScale::Medium => "medium",
            JobScale::Large => "large",
        }
    }

    /// Case-insensitive parse, so `"Medium"` and `"medium"` both work.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "small" => Some(JobScale::Small),
            "medium" => Some(JobScale::Medium),
            "large" => Some(JobScale::Large),
            _ => None,
        }
    }
}

/// Project, site and contact details attached to a job at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assessor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contractor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_manager_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_manager_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_aider_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_aider_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_officer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_officer_phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assembly_point: Option<String>,
}

/// Local projection of a `rams_generation_jobs` row.
///
/// Decoded from the full row snapshot the backend pushes on every write.
/// Columns not listed here are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: String,
    #[serde(default)]
    pub job_description: String,
    #[serde(default)]
    pub job_scale: Option<String>,
    #[serde(default)]
    pub project_info: Option<ProjectInfo>,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: Option<i64>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub rams_data: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl GenerationJob {
    /// Decode a row snapshot.
    pub fn from_row(row: Value) -> Result<Self> {
        Ok(serde_json::from_value(row)?)
    }

    /// Progress clamped to `0..=100`.
    pub fn progress_percent(&self) -> Option<u8> {
        self.progress.map(|p| p.clamp(0, 100) as u8)
    }

    /// Decode `rams_data`. `None` when the column is absent or null.
    pub fn result(&self) -> Option<Result<RamsResult>> {
        match &self.rams_data {
            None | Some(Value::Null) => None,
            Some(data) => Some(RamsResult::from_value(data.clone())),
        }
    }
}

fn nullable_vec<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The generated risk assessment.
///
/// Every section is a collection that may be empty; a missing or null
/// section decodes as empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RamsResult {
    #[serde(default, alias = "hazards", deserialize_with = "nullable_vec")]
    pub risks: Vec<RiskItem>,
    #[serde(
        default,
        alias = "ppe",
        alias = "ppe_details",
        deserialize_with = "nullable_vec"
    )]
    pub ppe_details: Vec<PpeItem>,
    #[serde(
        default,
        alias = "emergency_procedures",
        deserialize_with = "nullable_vec"
    )]
    pub emergency_procedures: Vec<String>,
    #[serde(
        default,
        alias = "compliance_regulations",
        deserialize_with = "nullable_vec"
    )]
    pub compliance_regulations: Vec<String>,
}

impl RamsResult {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(_) => Ok(serde_json::from_value(value)?),
            other => Err(CoordinatorError::Generation(format!(
                "Expected an object for the generated result, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn hazard_count(&self) -> usize {
        self.risks.len()
    }

    /// Highest pre-control risk level across all hazards.
    pub fn highest_risk(&self) -> Option<RiskLevel> {
        self.risks.iter().map(RiskItem::level).max()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A single assessed hazard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskItem {
    #[serde(default)]
    pub id: String,
    #[serde(default, alias = "risk")]
    pub hazard: String,
    /// 1-5
    #[serde(default)]
    pub likelihood: u8,
    /// 1-5
    #[serde(default)]
    pub severity: u8,
    #[serde(default, alias = "riskRating", alias = "risk_score")]
    pub risk_score: Option<u32>,
    #[serde(default, alias = "controls", alias = "control_measure")]
    pub control_measure: String,
    #[serde(default, alias = "residual_risk")]
    pub residual_risk: Option<u32>,
    /// 0 = general, 1..N = a specific method step.
    #[serde(default, alias = "linked_to_step")]
    pub linked_to_step: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regulation: Option<String>,
}

impl RiskItem {
    /// Stored score, or likelihood x severity when the generator omitted it.
    pub fn score(&self) -> u32 {
        self.risk_score
            .unwrap_or(self.likelihood as u32 * self.severity as u32)
    }

    pub fn level(&self) -> RiskLevel {
        RiskLevel::from_score(self.score())
    }

    pub fn residual_level(&self) -> Option<RiskLevel> {
        self.residual_risk.map(RiskLevel::from_score)
    }
}

/// A required item of personal protective equipment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PpeItem {
    #[serde(default)]
    pub item_number: u32,
    #[serde(default)]
    pub ppe_type: String,
    #[serde(default)]
    pub standard: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub purpose: String,
}

/// Risk banding on the 5x5 likelihood/severity matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 15 => RiskLevel::VeryHigh,
            s if s >= 10 => RiskLevel::High,
            s if s >= 6 => RiskLevel::Medium,
            _ => RiskLevel::Low,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::VeryHigh => "very-high",
        }
    }
}

/// Coordinator lifecycle phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Submitting,
    Awaiting,
    InProgress,
    Complete,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Phase::Idle => "idle",
            Phase::Submitting => "submitting",
            Phase::Awaiting => "awaiting",
            Phase::InProgress => "in_progress",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Complete | Phase::Failed)
    }

    /// A job is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(self, Phase::Submitting | Phase::Awaiting | Phase::InProgress)
    }

    /// Row updates are accepted only while tracking.
    pub fn is_tracking(&self) -> bool {
        matches!(self, Phase::Awaiting | Phase::InProgress)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Observable coordinator state, re-emitted after every transition.
///
/// `JobSnapshot::default()` is the `Idle` snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub phase: Phase,
    pub job_id: Option<String>,
    pub progress: u8,
    pub current_step: String,
    pub result: Option<RamsResult>,
    pub error: Option<String>,
}

/// Input for [`RamsCoordinator::submit`](crate::RamsCoordinator::submit).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmitRequest {
    pub description: String,
    pub scale: JobScale,
    pub project_info: ProjectInfo,
    pub linked_record_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_scale(mut self, scale: JobScale) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_project_info(mut self, info: ProjectInfo) -> Self {
        self.project_info = info;
        self
    }

    /// Flag this record once generation completes.
    pub fn linked_to(mut self, record_id: impl Into<String>) -> Self {
        self.linked_record_id = Some(record_id.into());
        self
    }

    /// Trimmed description, or a validation error if it is blank.
    pub fn validated_description(&self) -> Result<&str> {
        let trimmed = self.description.trim();
        if trimmed.is_empty() {
            return Err(CoordinatorError::Validation(
                "Job description must not be empty".into(),
            ));
        }
        Ok(trimmed)
    }
}
