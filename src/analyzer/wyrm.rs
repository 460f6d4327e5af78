//! Pre-analysis (Wyrm), spec §4.4. Produces a coarse recommendation
//! document before the detailed Wyvern pass runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forge_common::AgentType;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::planning_context::provider::{Message, Provider, SendOptions};
use crate::util::extract_json_object;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityEstimate {
    Low,
    Medium,
    High,
}

/// Wyrm's output, persisted as `wyrm-recommendation.json` and consumed
/// by Wyvern as a hint, not a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WyrmRecommendation {
    pub languages: Vec<String>,
    pub recommended_agent_types: Vec<AgentType>,
    pub technical_stack: Vec<String>,
    pub suggested_work_areas: Vec<String>,
    pub complexity: ComplexityEstimate,
    pub notes: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawWyrmRecommendation {
    languages: Vec<String>,
    #[serde(default)]
    recommended_agent_types: Vec<String>,
    #[serde(default)]
    technical_stack: Vec<String>,
    #[serde(default)]
    suggested_work_areas: Vec<String>,
    #[serde(default = "default_complexity")]
    complexity: ComplexityEstimate,
    #[serde(default)]
    notes: String,
}

fn default_complexity() -> ComplexityEstimate {
    ComplexityEstimate::Medium
}

/// Build the system prompt fed to the Wyrm provider call.
pub fn build_prompt(specification: &str) -> String {
    format!(
        "You are Wyrm, a pre-analysis agent. Read the specification below and \
         respond with a single JSON object with keys: languages (array of \
         strings), recommended_agent_types (array drawn from the closed agent \
         type catalog), technical_stack (array of strings), \
         suggested_work_areas (array of strings), complexity (one of \"low\", \
         \"medium\", \"high\"), notes (free text).\n\n---\n{specification}\n---"
    )
}

/// Parse a Wyrm provider response, discarding any agent-type string the
/// closed catalog doesn't recognize rather than failing the whole parse —
/// a hint with 9 good agent types and 1 typo is still useful.
pub fn parse_response(text: &str) -> Result<WyrmRecommendation> {
    let json = extract_json_object(text).context("wyrm response did not contain a JSON object")?;
    let raw: RawWyrmRecommendation =
        serde_json::from_str(&json).context("failed to parse wyrm recommendation JSON")?;

    let recommended_agent_types = raw
        .recommended_agent_types
        .iter()
        .filter_map(|s| match AgentType::parse(s) {
            Some(agent) => Some(agent),
            None => {
                warn!(agent_type = %s, "wyrm recommended an unknown agent type, dropping");
                None
            }
        })
        .collect();

    Ok(WyrmRecommendation {
        languages: raw.languages,
        recommended_agent_types,
        technical_stack: raw.technical_stack,
        suggested_work_areas: raw.suggested_work_areas,
        complexity: raw.complexity,
        notes: raw.notes,
        generated_at: Utc::now(),
    })
}

/// Run one Wyrm pass against `specification` through `provider`.
pub async fn analyze(provider: &dyn Provider, specification: &str) -> Result<WyrmRecommendation> {
    let prompt = build_prompt(specification);
    let response = provider
        .send(&[Message::User { content: prompt }], &[], &SendOptions::default())
        .await
        .context("wyrm provider call failed")?;

    let text = response
        .content
        .iter()
        .find_map(|block| match block {
            crate::planning_context::provider::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .context("wyrm response contained no text block")?;

    parse_response(text)
}
