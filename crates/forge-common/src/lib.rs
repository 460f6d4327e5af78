//! Shared domain types for the Forge orchestration platform.
//!
//! These types are owned by no single component: the Project Registry,
//! Task Tracker, Supervisor, and Shared Planning Context all read and
//! write them, so they live in a crate the whole workspace depends on
//! rather than in any one component's module tree.

pub mod agent_type;
pub mod plan;
pub mod project;
pub mod reflection;
pub mod session;
pub mod task;
pub mod worker;

pub use agent_type::{AgentType, ToolPermissionMask};
pub use plan::{ImplementationStep, Plan, StepStatus};
pub use project::{ExecutionState, Project, ProjectStatus, SandboxMode, SecurityPolicy};
pub use reflection::{Decision, Reflection};
pub use session::{Session, SessionMessage, SessionRole};
pub use task::{ErrorCategory, Priority, Task, TaskStatus};
pub use worker::{FileClaim, WorkerId, WorkerState};
