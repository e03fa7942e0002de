//! The role-gated tool dispatch surface.
//!
//! Maps named tool requests onto coordination-engine operations, enforces
//! the role → tool mapping, wraps every call in the default deadline, logs
//! request and response to the conversation log, and shapes all failures
//! into the common error envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use marcus_core::context::{CreateMode, ProjectContext, ProjectContextManager};
use marcus_core::error::{MarcusError, Result};
use marcus_core::models::{
    event_types, Agent, AgentRole, ArtifactMeta, Decision, Event, Impact, TaskStatus,
};
use marcus_core::persistence::{collections, Persistence, ProjectStore};
use marcus_core::contracts::{ProducerOptions, TaskProducer};

use crate::conversation::{ConversationEntry, ConversationLog, ConversationMetadata, Direction};
use crate::roles;

/// Deadline applied to every tool call
pub const DEFAULT_TOOL_DEADLINE: Duration = Duration::from_secs(30);

/// An authenticated client connection
#[derive(Debug, Clone)]
pub struct ClientSession {
    pub client_id: String,
    pub client_type: String,
    pub role: AgentRole,
    pub authenticated_at: DateTime<Utc>,
}

/// A tool invocation as received from the wire
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// Routes tool calls to the coordination engine.
pub struct ToolDispatcher {
    manager: Arc<ProjectContextManager>,
    persistence: Option<Arc<dyn Persistence>>,
    producer: Option<Arc<dyn TaskProducer>>,
    conversation: ConversationLog,
    sessions: RwLock<HashMap<String, ClientSession>>,
    instance_id: String,
    started_at: Instant,
    deadline: Duration,
}

impl ToolDispatcher {
    pub fn new(
        manager: Arc<ProjectContextManager>,
        persistence: Option<Arc<dyn Persistence>>,
        conversation: ConversationLog,
    ) -> Self {
        Self {
            manager,
            persistence,
            producer: None,
            conversation,
            sessions: RwLock::new(HashMap::new()),
            instance_id: uuid::Uuid::new_v4().to_string(),
            started_at: Instant::now(),
            deadline: DEFAULT_TOOL_DEADLINE,
        }
    }

    pub fn with_producer(mut self, producer: Arc<dyn TaskProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Dispatch one tool call. The response is always a JSON envelope;
    /// failures surface as `{success: false, error: {...}}`, never as Err.
    pub async fn dispatch(&self, request: ToolRequest) -> Value {
        let tool = request.tool.clone();
        let client_id = request.client_id.clone();
        let role = self.role_of(client_id.as_deref()).await;

        self.log_conversation(Direction::Request, &request, client_id.as_deref())
            .await;

        let outcome = if !roles::allows(role, &tool) {
            let err = if roles::ALL_TOOLS.contains(&tool.as_str()) {
                MarcusError::unauthorized(&tool, &role.to_string())
            } else {
                MarcusError::unknown_tool(&tool)
            };
            Err(err)
        } else {
            match tokio::time::timeout(
                self.deadline,
                self.execute(&tool, &request.arguments, client_id.as_deref(), role),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(MarcusError::timeout(&tool)),
            }
        };

        let response = match outcome {
            Ok(mut value) => {
                if let Value::Object(map) = &mut value {
                    map.insert("success".to_string(), json!(true));
                    map.insert("tool".to_string(), json!(tool));
                }
                value
            }
            Err(err) => {
                tracing::warn!(tool = %tool, error = %err, "Tool call failed");
                json!({
                    "success": false,
                    "error": {
                        "kind": err.kind,
                        "code": err.code,
                        "message": err.message,
                        "recoverable": err.recoverable,
                        "timestamp": err.timestamp,
                        "context": err.context,
                    },
                    "tool": tool,
                    "arguments": request.arguments,
                })
            }
        };

        self.log_response(&tool, &response, client_id.as_deref()).await;
        response
    }

    async fn role_of(&self, client_id: Option<&str>) -> AgentRole {
        let Some(client_id) = client_id else {
            return AgentRole::Observer;
        };
        self.sessions
            .read()
            .await
            .get(client_id)
            .map(|s| s.role)
            .unwrap_or(AgentRole::Observer)
    }

    async fn execute(
        &self,
        tool: &str,
        arguments: &Value,
        client_id: Option<&str>,
        role: AgentRole,
    ) -> Result<Value> {
        match tool {
            "ping" => self.ping().await,
            "authenticate" => self.authenticate(arguments).await,
            "register_agent" => self.register_agent(arguments).await,
            "request_next_task" => self.request_next_task(arguments).await,
            "report_task_progress" => self.report_task_progress(arguments).await,
            "report_blocker" => self.report_blocker(arguments).await,
            "log_decision" => self.log_decision(arguments, client_id).await,
            "log_artifact" => self.log_artifact(arguments, client_id).await,
            "create_project" => self.create_project(arguments).await,
            "switch_project" => self.switch_project(arguments).await,
            "list_projects" => self.list_projects().await,
            "get_project_status" => self.get_project_status(arguments).await,
            "get_task_context" => self.get_task_context(arguments).await,
            other => Err(MarcusError::unknown_tool(other).with_detail("role", role.to_string())),
        }
    }

    async fn ping(&self) -> Result<Value> {
        Ok(json!({
            "pong": true,
            "instance_id": self.instance_id,
            "uptime_seconds": self.started_at.elapsed().as_secs(),
            "timestamp": Utc::now(),
        }))
    }

    async fn authenticate(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            client_id: String,
            client_type: String,
            role: String,
            #[serde(default)]
            #[allow(dead_code)]
            metadata: Value,
        }
        let args: Args = parse_args(arguments)?;
        let role: AgentRole = args.role.parse()?;

        let session = ClientSession {
            client_id: args.client_id.clone(),
            client_type: args.client_type,
            role,
            authenticated_at: Utc::now(),
        };
        self.sessions
            .write()
            .await
            .insert(args.client_id.clone(), session);
        tracing::info!(client_id = %args.client_id, role = %role, "Client authenticated");

        Ok(json!({
            "role": role,
            "available_tools": roles::tools_for(role),
        }))
    }

    async fn register_agent(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            agent_id: String,
            name: String,
            #[serde(default)]
            capabilities: Vec<String>,
        }
        let args: Args = parse_args(arguments)?;
        if args.agent_id.trim().is_empty() {
            return Err(MarcusError::business_logic("Agent id cannot be empty"));
        }

        let context = self.manager.active().await?;
        let mut agent = Agent::new(&args.agent_id, &args.name, AgentRole::Agent);
        agent.capabilities = args.capabilities;
        let agent = context.agents().register(agent).await;

        context
            .bus()
            .publish(Event::new(
                event_types::AGENT_REGISTERED,
                context.project_id(),
                json!({ "agent_id": agent.agent_id, "capabilities": agent.capabilities }),
            ))
            .await;

        Ok(json!({
            "agent_id": agent.agent_id,
            "role": agent.role,
            "available_tools": roles::tools_for(agent.role),
        }))
    }

    async fn request_next_task(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            agent_id: String,
        }
        let args: Args = parse_args(arguments)?;

        let context = self.manager.active().await?;
        let agent = context.agents().get(&args.agent_id).await.ok_or_else(|| {
            MarcusError::business_logic(format!(
                "Agent '{}' is not registered in this project",
                args.agent_id
            ))
            .with_agent(args.agent_id.clone())
        })?;
        context.agents().heartbeat(&args.agent_id).await;

        match context.assignment().find_next_task(&agent).await? {
            Some(task) => {
                context
                    .agents()
                    .set_working(&args.agent_id, Some(task.task_id.clone()))
                    .await;
                Ok(json!({ "task": task }))
            }
            None => Ok(json!({ "task": null })),
        }
    }

    async fn report_task_progress(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            status: String,
            #[serde(default)]
            percent: Option<f64>,
            #[serde(default)]
            notes: Option<String>,
        }
        let args: Args = parse_args(arguments)?;
        let status: TaskStatus = args.status.parse()?;

        let context = self.manager.active().await?;
        if let Some(agent_id) = context
            .tasks()
            .get(&args.task_id)
            .await
            .and_then(|t| t.assigned_agent_id)
        {
            context.agents().heartbeat(&agent_id).await;
        }
        let task = context.update_task_status(&args.task_id, status).await?;

        Ok(json!({
            "acknowledged": true,
            "task_id": task.task_id,
            "status": task.status,
            "percent": args.percent,
            "notes": args.notes,
        }))
    }

    async fn report_blocker(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            description: String,
            #[serde(default = "default_severity")]
            severity: String,
        }
        fn default_severity() -> String {
            "medium".to_string()
        }
        let args: Args = parse_args(arguments)?;

        let context = self.manager.active().await?;
        let task = context
            .update_task_status(&args.task_id, TaskStatus::Blocked)
            .await?;

        tracing::warn!(
            task_id = %args.task_id,
            severity = %args.severity,
            "Blocker reported: {}",
            args.description
        );

        // Deterministic suggestions; AI-generated guidance rides on the
        // classifier collaborator when one is configured upstream.
        let suggestions = blocker_suggestions(&args.severity, &task.dependencies);
        Ok(json!({
            "acknowledged": true,
            "task_id": args.task_id,
            "severity": args.severity,
            "suggestions": suggestions,
        }))
    }

    async fn log_decision(&self, arguments: &Value, client_id: Option<&str>) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            what: String,
            why: String,
            impact: String,
            #[serde(default)]
            affected_tasks: Vec<String>,
            #[serde(default)]
            confidence: Option<f64>,
        }
        let args: Args = parse_args(arguments)?;
        let impact = parse_impact(&args.impact)?;
        let agent_id = client_id.unwrap_or("unknown");

        let context = self.manager.active().await?;
        let decision = Decision::new(
            &args.task_id,
            agent_id,
            &args.what,
            &args.why,
            impact,
            args.affected_tasks,
            args.confidence.unwrap_or(0.5),
        );

        self.project_store(&context)
            .save(collections::DECISIONS, &decision.decision_id, &decision)
            .await?;
        Ok(json!({ "decision_id": decision.decision_id }))
    }

    async fn log_artifact(&self, arguments: &Value, client_id: Option<&str>) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
            filename: String,
            artifact_type: String,
            #[serde(default)]
            description: String,
            /// Inline file content; mutually exclusive with `path`
            #[serde(default)]
            content: Option<String>,
            /// Path to the file on the server's filesystem
            #[serde(default)]
            path: Option<String>,
        }
        let args: Args = parse_args(arguments)?;
        let agent_id = client_id.unwrap_or("unknown");

        let (bytes, absolute_path) = match (&args.content, &args.path) {
            (Some(content), _) => (content.clone().into_bytes(), String::new()),
            (None, Some(path)) => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    MarcusError::business_logic(format!("Cannot read artifact file '{path}': {e}"))
                })?;
                (bytes, path.clone())
            }
            (None, None) => {
                return Err(MarcusError::business_logic(
                    "log_artifact requires either 'content' or 'path'",
                ))
            }
        };

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let sha256_hash = hex::encode(hasher.finalize());

        let context = self.manager.active().await?;
        let artifact = ArtifactMeta {
            artifact_id: uuid::Uuid::new_v4().to_string(),
            task_id: args.task_id,
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
            artifact_type: args.artifact_type,
            relative_path: args.filename.clone(),
            filename: args.filename,
            absolute_path,
            description: args.description,
            file_size_bytes: bytes.len() as u64,
            sha256_hash,
        };

        self.project_store(&context)
            .save(collections::ARTIFACTS, &artifact.artifact_id, &artifact)
            .await?;

        // Record the produced path on the task itself when it still exists
        let produced = artifact.relative_path.clone();
        let _ = context
            .tasks()
            .update(&artifact.task_id, |task| {
                if !task.file_artifacts.contains(&produced) {
                    task.file_artifacts.push(produced.clone());
                }
                Ok(())
            })
            .await;

        Ok(json!({
            "artifact_id": artifact.artifact_id,
            "sha256": artifact.sha256_hash,
            "file_size_bytes": artifact.file_size_bytes,
        }))
    }

    async fn create_project(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize, Default)]
        struct Options {
            #[serde(default)]
            mode: Option<CreateMode>,
            #[serde(default)]
            project_id: Option<String>,
        }
        #[derive(Deserialize)]
        struct Args {
            name: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            options: Option<Options>,
        }
        let args: Args = parse_args(arguments)?;
        let options = args.options.unwrap_or_default();
        let mode = options.mode.unwrap_or_default();

        let (context, created) = self
            .manager
            .create_project(&args.name, mode, options.project_id)
            .await?;

        let mut tasks_created = 0;
        let mut warnings: Vec<String> = Vec::new();
        if created && !args.description.trim().is_empty() {
            if let Some(producer) = &self.producer {
                let generated = producer
                    .generate(&args.description, &ProducerOptions::default())
                    .await?;
                let (count, fix_warnings) = context.submit_tasks(generated).await?;
                tasks_created = count;
                warnings = fix_warnings;
            }
        }

        Ok(json!({
            "project_id": context.project_id(),
            "created": created,
            "tasks_created": tasks_created,
            "warnings": warnings,
        }))
    }

    async fn switch_project(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            #[serde(default)]
            project_id: Option<String>,
            #[serde(default)]
            name: Option<String>,
        }
        let args: Args = parse_args(arguments)?;

        let project_id = match (args.project_id, args.name) {
            (Some(id), _) => id,
            (None, Some(name)) => self
                .manager
                .list_projects()
                .await?
                .into_iter()
                .find(|p| p.project_name == name)
                .map(|p| p.project_id)
                .ok_or_else(|| {
                    MarcusError::business_logic(format!("No project named '{name}' exists"))
                })?,
            (None, None) => {
                return Err(MarcusError::business_logic(
                    "switch_project requires 'project_id' or 'name'",
                ))
            }
        };

        let context = self.manager.switch(&project_id).await?;
        Ok(json!({ "active_project_id": context.project_id() }))
    }

    async fn list_projects(&self) -> Result<Value> {
        let projects = self.manager.list_projects().await?;
        Ok(json!({ "projects": projects }))
    }

    async fn get_project_status(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize, Default)]
        struct Args {
            #[serde(default)]
            project_id: Option<String>,
        }
        let args: Args = if arguments.is_null() {
            Args::default()
        } else {
            parse_args(arguments)?
        };

        let context = match args.project_id {
            Some(project_id) => self.manager.get_or_create(&project_id).await?,
            None => self.manager.active().await?,
        };
        let status = context.status_summary().await;
        Ok(json!({ "status": status }))
    }

    async fn get_task_context(&self, arguments: &Value) -> Result<Value> {
        #[derive(Deserialize)]
        struct Args {
            task_id: String,
        }
        let args: Args = parse_args(arguments)?;

        let context = self.manager.active().await?;
        let task = context.tasks().get(&args.task_id).await;

        // Project membership comes from the pool and the conversation
        // index, the authoritative mapping from a project to its task ids.
        // Rows are then matched by task id alone; the project_id copy
        // inside decision/artifact rows exists only for validation.
        let in_project = task.is_some()
            || self
                .indexed_task_ids(context.project_id())
                .await?
                .iter()
                .any(|t| t == &args.task_id);

        let (decisions, artifacts) = match (&self.persistence, in_project) {
            (Some(persistence), true) => {
                let task_id = args.task_id.clone();
                let matches = move |v: &Value| {
                    v.get("task_id").and_then(Value::as_str) == Some(task_id.as_str())
                };
                let decisions = persistence
                    .query(collections::DECISIONS, &matches, 1000, 0)
                    .await?;
                let artifacts = persistence
                    .query(collections::ARTIFACTS, &matches, 1000, 0)
                    .await?;
                (decisions, artifacts)
            }
            _ => (vec![], vec![]),
        };

        let conversation =
            self.conversation
                .recent_for_task(context.project_id(), &args.task_id, 20);
        Ok(json!({
            "task": task,
            "decisions": decisions,
            "artifacts": artifacts,
            "conversation": conversation,
        }))
    }

    /// Task ids recorded for a project in the conversation index
    async fn indexed_task_ids(&self, project_id: &str) -> Result<Vec<String>> {
        let Some(persistence) = &self.persistence else {
            return Ok(vec![]);
        };
        let Some(entry) = persistence
            .retrieve(collections::CONVERSATION_INDEX, project_id)
            .await?
        else {
            return Ok(vec![]);
        };
        Ok(entry
            .get("task_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default())
    }

    fn project_store(&self, context: &Arc<ProjectContext>) -> ProjectStore {
        ProjectStore::new(context.project_id(), self.persistence.clone())
    }

    async fn log_conversation(
        &self,
        direction: Direction,
        request: &ToolRequest,
        client_id: Option<&str>,
    ) {
        let project_id = self
            .manager
            .current()
            .await
            .map(|c| c.project_id().to_string());
        let task_id = request
            .arguments
            .get("task_id")
            .and_then(Value::as_str)
            .map(String::from);
        let entry = ConversationEntry {
            timestamp: Utc::now(),
            direction,
            agent_id: client_id
                .map(String::from)
                .or_else(|| {
                    request
                        .arguments
                        .get("agent_id")
                        .and_then(Value::as_str)
                        .map(String::from)
                }),
            content: json!({ "tool": request.tool, "arguments": request.arguments }),
            metadata: ConversationMetadata {
                project_id,
                task_id,
                message_type: Some("tool_request".to_string()),
            },
        };
        if let Err(err) = self.conversation.append(entry).await {
            tracing::warn!(error = %err, "Failed to append conversation log");
        }
    }

    async fn log_response(&self, tool: &str, response: &Value, client_id: Option<&str>) {
        let project_id = self
            .manager
            .current()
            .await
            .map(|c| c.project_id().to_string());
        let entry = ConversationEntry {
            timestamp: Utc::now(),
            direction: Direction::Response,
            agent_id: client_id.map(String::from),
            content: json!({ "tool": tool, "response": response }),
            metadata: ConversationMetadata {
                project_id,
                task_id: None,
                message_type: Some("tool_response".to_string()),
            },
        };
        if let Err(err) = self.conversation.append(entry).await {
            tracing::warn!(error = %err, "Failed to append conversation log");
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: &Value) -> Result<T> {
    serde_json::from_value(arguments.clone())
        .map_err(|e| MarcusError::business_logic(format!("Invalid tool arguments: {e}")))
}

fn parse_impact(raw: &str) -> Result<Impact> {
    match raw {
        "low" => Ok(Impact::Low),
        "medium" => Ok(Impact::Medium),
        "major" => Ok(Impact::Major),
        "critical" => Ok(Impact::Critical),
        other => Err(MarcusError::business_logic(format!(
            "Unknown impact '{other}'"
        ))),
    }
}

fn blocker_suggestions(severity: &str, dependencies: &[String]) -> Vec<String> {
    let mut suggestions = vec![
        "Check whether a dependency task produced the artifacts you need".to_string(),
        "Log a decision describing the blocker so other agents can route around it".to_string(),
    ];
    if !dependencies.is_empty() {
        suggestions.push(format!(
            "Review the state of upstream tasks: {}",
            dependencies.join(", ")
        ));
    }
    if severity == "critical" {
        suggestions.push("Escalate to the project developer for manual intervention".to_string());
    }
    suggestions
}

/// Convenience wrapper used by transports
pub async fn dispatch_value(dispatcher: &ToolDispatcher, raw: Value) -> Value {
    match serde_json::from_value::<ToolRequest>(raw.clone()) {
        Ok(request) => dispatcher.dispatch(request).await,
        Err(e) => {
            let err = MarcusError::business_logic(format!("Malformed tool request: {e}"));
            json!({
                "success": false,
                "error": {
                    "kind": err.kind,
                    "code": err.code,
                    "message": err.message,
                    "recoverable": err.recoverable,
                    "timestamp": err.timestamp,
                    "context": err.context,
                },
                "tool": raw.get("tool").cloned().unwrap_or(Value::Null),
                "arguments": raw.get("arguments").cloned().unwrap_or(Value::Null),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marcus_core::context::ContextConfig;
    use marcus_core::models::NewTask;

    fn dispatcher() -> ToolDispatcher {
        let config = ContextConfig {
            persist_events: false,
            ..ContextConfig::default()
        };
        let manager = Arc::new(ProjectContextManager::new(config, None));
        ToolDispatcher::new(manager, None, ConversationLog::in_memory())
    }

    async fn authenticate(dispatcher: &ToolDispatcher, client_id: &str, role: &str) {
        let response = dispatcher
            .dispatch(ToolRequest {
                tool: "authenticate".to_string(),
                arguments: json!({
                    "client_id": client_id,
                    "client_type": "test",
                    "role": role,
                }),
                client_id: Some(client_id.to_string()),
            })
            .await;
        assert_eq!(response["success"], true, "{response}");
    }

    #[tokio::test]
    async fn ping_is_open_to_everyone() {
        let d = dispatcher();
        let response = d
            .dispatch(ToolRequest {
                tool: "ping".to_string(),
                arguments: Value::Null,
                client_id: None,
            })
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(response["pong"], true);
        assert!(response["instance_id"].is_string());
    }

    #[tokio::test]
    async fn unauthenticated_clients_are_observers() {
        let d = dispatcher();
        let response = d
            .dispatch(ToolRequest {
                tool: "create_project".to_string(),
                arguments: json!({ "name": "X" }),
                client_id: Some("stranger".to_string()),
            })
            .await;
        assert_eq!(response["success"], false);
        assert_eq!(response["error"]["code"], "unauthorized");
        assert_eq!(response["tool"], "create_project");
    }

    #[tokio::test]
    async fn unknown_tools_are_rejected() {
        let d = dispatcher();
        let response = d
            .dispatch(ToolRequest {
                tool: "drop_everything".to_string(),
                arguments: Value::Null,
                client_id: None,
            })
            .await;
        assert_eq!(response["success"], false);
        assert_eq!(response["error"]["code"], "unknown_tool");
    }

    #[tokio::test]
    async fn authenticate_returns_the_role_tool_list() {
        let d = dispatcher();
        let response = d
            .dispatch(ToolRequest {
                tool: "authenticate".to_string(),
                arguments: json!({
                    "client_id": "worker-1",
                    "client_type": "agent",
                    "role": "agent",
                }),
                client_id: Some("worker-1".to_string()),
            })
            .await;
        assert_eq!(response["success"], true);
        assert_eq!(response["role"], "agent");
        let tools: Vec<String> =
            serde_json::from_value(response["available_tools"].clone()).unwrap();
        assert!(tools.contains(&"request_next_task".to_string()));
        assert!(!tools.contains(&"create_project".to_string()));
    }

    #[tokio::test]
    async fn tools_requiring_an_active_project_fail_without_one() {
        let d = dispatcher();
        authenticate(&d, "worker-1", "agent").await;
        let response = d
            .dispatch(ToolRequest {
                tool: "register_agent".to_string(),
                arguments: json!({ "agent_id": "w1", "name": "Worker", "capabilities": [] }),
                client_id: Some("worker-1".to_string()),
            })
            .await;
        assert_eq!(response["success"], false);
        assert_eq!(response["error"]["code"], "no_active_project");
    }

    #[tokio::test]
    async fn full_agent_workflow_through_the_surface() {
        let d = dispatcher();
        authenticate(&d, "admin-1", "admin").await;
        authenticate(&d, "worker-1", "agent").await;

        let created = d
            .dispatch(ToolRequest {
                tool: "create_project".to_string(),
                arguments: json!({ "name": "Demo" }),
                client_id: Some("admin-1".to_string()),
            })
            .await;
        assert_eq!(created["success"], true, "{created}");

        // Seed a task directly through the context
        let context = d.manager.active().await.unwrap();
        context
            .submit_tasks(vec![NewTask::new("t1", "Build the thing")])
            .await
            .unwrap();

        let registered = d
            .dispatch(ToolRequest {
                tool: "register_agent".to_string(),
                arguments: json!({ "agent_id": "w1", "name": "Worker", "capabilities": ["rust"] }),
                client_id: Some("worker-1".to_string()),
            })
            .await;
        assert_eq!(registered["success"], true, "{registered}");

        let assigned = d
            .dispatch(ToolRequest {
                tool: "request_next_task".to_string(),
                arguments: json!({ "agent_id": "w1" }),
                client_id: Some("worker-1".to_string()),
            })
            .await;
        assert_eq!(assigned["success"], true);
        assert_eq!(assigned["task"]["task_id"], "t1");

        let progressed = d
            .dispatch(ToolRequest {
                tool: "report_task_progress".to_string(),
                arguments: json!({ "task_id": "t1", "status": "in_progress", "percent": 25 }),
                client_id: Some("worker-1".to_string()),
            })
            .await;
        assert_eq!(progressed["success"], true, "{progressed}");

        let completed = d
            .dispatch(ToolRequest {
                tool: "report_task_progress".to_string(),
                arguments: json!({ "task_id": "t1", "status": "completed" }),
                client_id: Some("worker-1".to_string()),
            })
            .await;
        assert_eq!(completed["success"], true, "{completed}");
        assert_eq!(completed["status"], "completed");

        // No more work
        let empty = d
            .dispatch(ToolRequest {
                tool: "request_next_task".to_string(),
                arguments: json!({ "agent_id": "w1" }),
                client_id: Some("worker-1".to_string()),
            })
            .await;
        assert_eq!(empty["task"], Value::Null);

        let status = d
            .dispatch(ToolRequest {
                tool: "get_project_status".to_string(),
                arguments: Value::Null,
                client_id: None,
            })
            .await;
        assert_eq!(status["status"]["completed"], 1);
    }

    #[tokio::test]
    async fn report_blocker_returns_suggestions() {
        let d = dispatcher();
        authenticate(&d, "admin-1", "admin").await;
        d.dispatch(ToolRequest {
            tool: "create_project".to_string(),
            arguments: json!({ "name": "Demo" }),
            client_id: Some("admin-1".to_string()),
        })
        .await;

        let context = d.manager.active().await.unwrap();
        context
            .submit_tasks(vec![NewTask::new("t1", "Work")])
            .await
            .unwrap();
        context
            .tasks()
            .transition("t1", TaskStatus::Assigned)
            .await
            .unwrap();

        let response = d
            .dispatch(ToolRequest {
                tool: "report_blocker".to_string(),
                arguments: json!({
                    "task_id": "t1",
                    "description": "missing credentials",
                    "severity": "critical",
                }),
                client_id: Some("admin-1".to_string()),
            })
            .await;
        assert_eq!(response["success"], true, "{response}");
        let suggestions = response["suggestions"].as_array().unwrap();
        assert!(!suggestions.is_empty());
        assert!(suggestions
            .iter()
            .any(|s| s.as_str().unwrap().contains("Escalate")));
    }
}
