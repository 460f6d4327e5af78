//! Sage: specification authoring and feature management (spec §4.3).

use std::sync::Arc;
use uuid::Uuid;

use crate::planning_context::provider::{Message, Provider, ProviderError, SendOptions};
use crate::registry::ProjectRegistry;

const SAGE_SYSTEM_PROMPT: &str = r#"You are Sage, the specification-authoring council member of an
interactive project assistant. Help the user describe, refine, or extend a
project specification. Ask clarifying questions when the request is vague.

When the user's request is concrete enough to produce or revise the full
specification document, emit it inside <spec>...</spec> tags. Otherwise
respond conversationally without the tags."#;

/// Sage's reply to a user turn: the conversational text, plus the
/// specification text if the reply produced a new one.
pub struct SageReply {
    pub text: String,
    pub specification: Option<String>,
}

pub async fn respond(
    provider: &Arc<dyn Provider>,
    registry: &ProjectRegistry,
    project_id: Option<Uuid>,
    history: &str,
    user_text: &str,
) -> Result<SageReply, ProviderError> {
    let prompt = format!("{SAGE_SYSTEM_PROMPT}\n\n{history}\n\nUser: {user_text}");
    let response = provider.send(&[Message::User { content: prompt }], &[], &SendOptions::default()).await?;

    let text = response
        .content
        .iter()
        .filter_map(|block| match block {
            crate::planning_context::provider::ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let specification = extract_spec(&text);
    if let Some(spec) = &specification {
        if let Some(project_id) = project_id {
            let _ = registry.update_specification(project_id, spec.clone()).await;
        }
    }

    Ok(SageReply { text, specification })
}

/// Extract content from `<spec>...</spec>` tags, trimmed of surrounding
/// whitespace. Returns `None` if no spec tags are present.
fn extract_spec(text: &str) -> Option<String> {
    let start_tag = "<spec>";
    let end_tag = "</spec>";

    let start_idx = text.find(start_tag)?;
    let content_start = start_idx + start_tag.len();
    let end_idx = text[content_start..].find(end_tag)?;

    let content = &text[content_start..content_start + end_idx];
    Some(content.trim().to_string())
}
