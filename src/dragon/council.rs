//! Council dispatch: which sub-agent handles a Dragon turn (spec §4.3.1).

use std::fmt;

/// The four sub-agents that mediate a user request through Dragon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CouncilMember {
    /// Specification authoring and feature management.
    #[default]
    Sage,
    /// Importing existing projects.
    Seeker,
    /// Git status / merge operations.
    Sentinel,
    /// Configuration, execution control, retry dispatch.
    Warden,
}

impl CouncilMember {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouncilMember::Sage => "sage",
            CouncilMember::Seeker => "seeker",
            CouncilMember::Sentinel => "sentinel",
            CouncilMember::Warden => "warden",
        }
    }
}

impl fmt::Display for CouncilMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split a leading `/command` off a user turn, if present.
fn slash_command(text: &str) -> Option<&str> {
    text.strip_prefix('/')?.split_whitespace().next()
}

/// Classify a user turn into the council member that should handle it.
/// Advisory only — the chosen member may decline and Dragon falls back
/// to Sage (the default arm here).
pub fn classify_intent(text: &str) -> CouncilMember {
    let trimmed = text.trim();

    if let Some(command) = slash_command(trimmed) {
        match command {
            "import" | "scan" => return CouncilMember::Seeker,
            "git" | "merge" | "status" => return CouncilMember::Sentinel,
            "pause" | "resume" | "suspend" | "cancel" | "retry" | "config" | "provider" | "model" => {
                return CouncilMember::Warden;
            }
            _ => {}
        }
    }

    let lower = trimmed.to_lowercase();

    if lower.contains("import") || lower.contains("existing project") || lower.contains("scan") {
        return CouncilMember::Seeker;
    }

    if lower.contains("git") || lower.contains("merge") || lower.contains("status") {
        return CouncilMember::Sentinel;
    }

    if lower.contains("pause")
        || lower.contains("resume")
        || lower.contains("cancel")
        || lower.contains("retry")
        || lower.contains("config")
        || lower.contains("provider")
        || lower.contains("model")
    {
        return CouncilMember::Warden;
    }

    CouncilMember::Sage
}
