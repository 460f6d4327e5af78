//! The closed agent-type catalog and its tool-permission mask (spec §4.4, §4.4.1).
//!
//! An agent type selects a system prompt template and a tool-permission
//! profile. It never changes scheduling semantics — the scheduler treats
//! all agent types identically except for per-agent-type parallelism caps
//! and timeouts configured on the project.

use serde::{Deserialize, Serialize};

/// The closed catalog of agent types a task can be assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Coding,
    Debug,
    Documentation,
    Refactor,
    Test,
    Csharp,
    Cpp,
    Assembler,
    Javascript,
    Typescript,
    Css,
    Html,
    React,
    Angular,
    Php,
    Python,
    Media,
    Image,
    Svg,
    Bitmap,
    Diagramming,
}

impl AgentType {
    /// All variants, in catalog order. Used by config validation and by
    /// Wyrm when it needs to enumerate a full recommendation set.
    pub const ALL: &'static [AgentType] = &[
        AgentType::Coding,
        AgentType::Debug,
        AgentType::Documentation,
        AgentType::Refactor,
        AgentType::Test,
        AgentType::Csharp,
        AgentType::Cpp,
        AgentType::Assembler,
        AgentType::Javascript,
        AgentType::Typescript,
        AgentType::Css,
        AgentType::Html,
        AgentType::React,
        AgentType::Angular,
        AgentType::Php,
        AgentType::Python,
        AgentType::Media,
        AgentType::Image,
        AgentType::Svg,
        AgentType::Bitmap,
        AgentType::Diagramming,
    ];

    /// The tool-permission mask for this agent type, resolved from the
    /// constant table in spec §4.4.1.
    pub fn permission_mask(self) -> ToolPermissionMask {
        match self {
            AgentType::Documentation => ToolPermissionMask {
                fs_read: true,
                fs_write: true,
                run_command: false,
            },
            AgentType::Media
            | AgentType::Image
            | AgentType::Svg
            | AgentType::Bitmap
            | AgentType::Diagramming => ToolPermissionMask {
                fs_read: true,
                fs_write: true,
                run_command: false,
            },
            _ => ToolPermissionMask {
                fs_read: true,
                fs_write: true,
                run_command: true,
            },
        }
    }

    /// Stable identifier used in config files and on-disk records.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Coding => "coding",
            AgentType::Debug => "debug",
            AgentType::Documentation => "documentation",
            AgentType::Refactor => "refactor",
            AgentType::Test => "test",
            AgentType::Csharp => "csharp",
            AgentType::Cpp => "cpp",
            AgentType::Assembler => "assembler",
            AgentType::Javascript => "javascript",
            AgentType::Typescript => "typescript",
            AgentType::Css => "css",
            AgentType::Html => "html",
            AgentType::React => "react",
            AgentType::Angular => "angular",
            AgentType::Php => "php",
            AgentType::Python => "python",
            AgentType::Media => "media",
            AgentType::Image => "image",
            AgentType::Svg => "svg",
            AgentType::Bitmap => "bitmap",
            AgentType::Diagramming => "diagramming",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|a| a.as_str() == s)
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Capability bits consulted both when Wyvern assigns an `agentType` to a
/// task and when a Kobold worker filters its tool catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermissionMask {
    pub fs_read: bool,
    pub fs_write: bool,
    pub run_command: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn documentation_cannot_run_commands() {
        let mask = AgentType::Documentation.permission_mask();
        assert!(mask.fs_read);
        assert!(mask.fs_write);
        assert!(!mask.run_command);
    }

    #[test]
    fn media_agents_cannot_run_commands() {
        for agent in [
            AgentType::Media,
            AgentType::Image,
            AgentType::Svg,
            AgentType::Bitmap,
            AgentType::Diagramming,
        ] {
            assert!(!agent.permission_mask().run_command, "{agent} should not run commands");
        }
    }

    #[test]
    fn code_agents_have_full_permissions() {
        for agent in [
            AgentType::Coding,
            AgentType::Csharp,
            AgentType::React,
            AgentType::Python,
        ] {
            let mask = agent.permission_mask();
            assert!(mask.fs_read && mask.fs_write && mask.run_command);
        }
    }

    #[test]
    fn parse_round_trips_display() {
        for agent in AgentType::ALL {
            assert_eq!(AgentType::parse(agent.as_str()), Some(*agent));
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        assert_eq!(AgentType::parse("cobol"), None);
    }
}
