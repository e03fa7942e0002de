//! Role-based access to the tool surface.
//!
//! Each client authenticates into one of four roles; the role → tool-set
//! mapping is static and the admin role implicitly includes every tool.

use marcus_core::models::AgentRole;

/// Every tool the dispatcher exposes
pub const ALL_TOOLS: &[&str] = &[
    "register_agent",
    "authenticate",
    "request_next_task",
    "report_task_progress",
    "report_blocker",
    "log_decision",
    "log_artifact",
    "create_project",
    "switch_project",
    "list_projects",
    "get_project_status",
    "get_task_context",
    "ping",
];

/// Tools available regardless of role
const UNIVERSAL_TOOLS: &[&str] = &["authenticate", "get_project_status", "get_task_context", "ping"];

const AGENT_TOOLS: &[&str] = &[
    "register_agent",
    "request_next_task",
    "report_task_progress",
    "report_blocker",
    "log_decision",
    "log_artifact",
];

const DEVELOPER_TOOLS: &[&str] = &[
    "log_decision",
    "log_artifact",
    "create_project",
    "switch_project",
    "list_projects",
];

/// Whether `role` may call `tool`
pub fn allows(role: AgentRole, tool: &str) -> bool {
    if !ALL_TOOLS.contains(&tool) {
        return false;
    }
    match role {
        AgentRole::Admin => true,
        AgentRole::Observer => UNIVERSAL_TOOLS.contains(&tool),
        AgentRole::Agent => UNIVERSAL_TOOLS.contains(&tool) || AGENT_TOOLS.contains(&tool),
        AgentRole::Developer => UNIVERSAL_TOOLS.contains(&tool) || DEVELOPER_TOOLS.contains(&tool),
    }
}

/// The tool list advertised to a role after authentication
pub fn tools_for(role: AgentRole) -> Vec<&'static str> {
    ALL_TOOLS
        .iter()
        .copied()
        .filter(|tool| allows(role, tool))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_gets_everything() {
        for tool in ALL_TOOLS {
            assert!(allows(AgentRole::Admin, tool), "{tool}");
        }
        assert_eq!(tools_for(AgentRole::Admin).len(), ALL_TOOLS.len());
    }

    #[test]
    fn observers_are_read_only() {
        assert!(allows(AgentRole::Observer, "ping"));
        assert!(allows(AgentRole::Observer, "get_project_status"));
        assert!(allows(AgentRole::Observer, "get_task_context"));
        assert!(!allows(AgentRole::Observer, "request_next_task"));
        assert!(!allows(AgentRole::Observer, "create_project"));
        assert!(!allows(AgentRole::Observer, "log_decision"));
    }

    #[test]
    fn agents_work_tasks_but_do_not_manage_projects() {
        assert!(allows(AgentRole::Agent, "register_agent"));
        assert!(allows(AgentRole::Agent, "request_next_task"));
        assert!(allows(AgentRole::Agent, "report_task_progress"));
        assert!(allows(AgentRole::Agent, "report_blocker"));
        assert!(allows(AgentRole::Agent, "log_decision"));
        assert!(!allows(AgentRole::Agent, "create_project"));
        assert!(!allows(AgentRole::Agent, "switch_project"));
        assert!(!allows(AgentRole::Agent, "list_projects"));
    }

    #[test]
    fn developers_manage_projects_but_do_not_take_work() {
        assert!(allows(AgentRole::Developer, "create_project"));
        assert!(allows(AgentRole::Developer, "switch_project"));
        assert!(allows(AgentRole::Developer, "list_projects"));
        assert!(allows(AgentRole::Developer, "log_artifact"));
        assert!(!allows(AgentRole::Developer, "request_next_task"));
        assert!(!allows(AgentRole::Developer, "register_agent"));
    }

    #[test]
    fn unknown_tools_are_denied_for_everyone() {
        assert!(!allows(AgentRole::Admin, "drop_database"));
        assert!(!allows(AgentRole::Observer, ""));
    }
}
