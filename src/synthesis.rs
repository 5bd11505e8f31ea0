//! Turns an accumulated interview transcript into the three plan artifacts:
//! a structured requirements document, a plain-language user summary, and a
//! detailed technical plan for the inviting admin.

use crate::completions::{ChatMessage, ChatRequest, CompletionBackend, CompletionError};
use crate::models::plans::PlanArtifacts;
use crate::models::turns::Turn;
use crate::requirements::{RequirementsDocument, RequirementsError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const SYNTHESIS_TEMPERATURE: f32 = 0.3;

const REQUIREMENTS_PROMPT: &str = "You are extracting structured requirements from a discovery \
interview transcript. Respond with a single JSON object and nothing else, with fields: \
project_name (string), goals (array of strings), features (array of strings), constraints \
(array of strings), target_audience (string), cost_estimate (string), timeline_estimate \
(string).";

const USER_SUMMARY_PROMPT: &str = "Write a short, friendly, plain-language summary of the \
project discussed in this discovery interview, addressed to the visitor. No jargon, no \
pricing internals.";

const TECHNICAL_PLAN_PROMPT: &str = "Write a detailed technical project plan for the team that \
will build this project: recommended tech stack, architecture outline, phased timeline, and a \
cost estimate with assumptions.";

#[derive(Error, Debug)]
pub enum SynthesisError {
    #[error("Upstream generation failed: {0}")]
    Upstream(#[from] CompletionError),
    #[error("Requirements extraction failed: {0}")]
    Requirements(#[from] RequirementsError),
    #[error("Transcript is empty")]
    EmptyTranscript,
}

/// Seam between the orchestrator and the synthesis pipeline, so retry and
/// side-effect ordering can be tested against a scripted implementation.
#[async_trait]
pub trait PlanSynthesis: Send + Sync {
    async fn generate_final_outputs(&self, turns: &[Turn]) -> Result<PlanArtifacts, SynthesisError>;
}

pub struct PlanSynthesizer {
    completions: Arc<dyn CompletionBackend>,
    model: String,
}

impl PlanSynthesizer {
    pub fn new(completions: Arc<dyn CompletionBackend>, model: String) -> Self {
        Self { completions, model }
    }

    async fn complete_with(&self, system: &str, transcript: &str) -> Result<String, SynthesisError> {
        let completion = self
            .completions
            .complete(ChatRequest {
                model: self.model.clone(),
                messages: vec![
                    ChatMessage::system(system),
                    ChatMessage::user(format!("Interview transcript:\n\n{}", transcript)),
                ],
                temperature: SYNTHESIS_TEMPERATURE,
                max_tokens: None,
            })
            .await?;
        Ok(completion.content)
    }
}

#[async_trait]
impl PlanSynthesis for PlanSynthesizer {
    async fn generate_final_outputs(&self, turns: &[Turn]) -> Result<PlanArtifacts, SynthesisError> {
        if turns.is_empty() {
            return Err(SynthesisError::EmptyTranscript);
        }

        let transcript = render_transcript(turns);
        debug!("Synthesizing plan from {} turns", turns.len());

        // Extraction first: if the model cannot produce valid structured
        // requirements there is no point paying for the other two calls.
        let raw_requirements = self.complete_with(REQUIREMENTS_PROMPT, &transcript).await?;
        let requirements = RequirementsDocument::from_model_json(&raw_requirements)?;

        let user_summary = self.complete_with(USER_SUMMARY_PROMPT, &transcript).await?;
        let technical_plan = self.complete_with(TECHNICAL_PLAN_PROMPT, &transcript).await?;

        info!(
            "Synthesis complete for project '{}' ({} goals, {} features)",
            requirements.project_name,
            requirements.goals.len(),
            requirements.features.len()
        );

        Ok(PlanArtifacts {
            cost_estimate: requirements.cost_estimate.clone(),
            timeline_estimate: requirements.timeline_estimate.clone(),
            structured_requirements: requirements.to_value(),
            user_summary,
            technical_plan,
        })
    }
}

fn render_transcript(turns: &[Turn]) -> String {
    let mut out = String::new();
    for turn in turns {
        if !turn.user_message.is_empty() {
            out.push_str(&format!("Visitor: {}\n", turn.user_message));
        }
        out.push_str(&format!("Consultant: {}\n", turn.assistant_message));
    }
    out
}
