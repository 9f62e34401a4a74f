use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tera::Context;
use tracing::{debug, info};

use crate::environments::{Environment, EnvironmentError, ExecutionOutput};
use crate::errors::{ExitStatus, FlowInterrupt};
use crate::models::message::Message;
use crate::prompt_template::render_template;
use crate::providers::{Action, ModelStats, ModelTurn, Provider, ProviderError};
use crate::registry::SubagentRegistry;

/// First line of command output that declares the task finished; the rest
/// of the output is the submission.
pub const COMPLETION_MARKER: &str = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT";

/// First line of an action that delegates to a subagent:
/// `DELEGATE_TASK_TO_SUBAGENT::<name>` followed by the task body.
pub const SPAWN_MARKER: &str = "DELEGATE_TASK_TO_SUBAGENT";

pub const SPAWN_SEPARATOR: &str = "::";

pub const ROOT_AGENT_ID: &str = "ROOT";

/// Execution policy for actions. Root-owned: every agent in a hierarchy
/// reads the same cell, so a switch at any depth applies everywhere.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Mode {
    /// Confirm every action, whitelist or not.
    Human,
    /// Confirm actions that do not match a whitelist pattern.
    #[default]
    Confirm,
    /// Execute everything immediately.
    Yolo,
}

/// Shared handle to the root agent's mode. Cloned into every child so
/// reads and writes go through one cell per hierarchy — never a global.
#[derive(Debug, Clone)]
pub struct ModeCell(Arc<RwLock<Mode>>);

impl ModeCell {
    pub fn new(mode: Mode) -> Self {
        ModeCell(Arc::new(RwLock::new(mode)))
    }

    pub fn get(&self) -> Mode {
        *self.0.read().unwrap()
    }

    pub fn set(&self, mode: Mode) {
        info!(%mode, "mode switched for the whole hierarchy");
        *self.0.write().unwrap() = mode;
    }
}

/// Cooperative cancellation flag, observed at step boundaries only.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of reviewing one action before execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Approve,
    /// Skip the action; the comment is folded into history so the model
    /// sees why.
    Reject(String),
    Interrupt,
}

/// Hook consulted before executing an action when the mode requires it.
/// The CLI implements this interactively; the default approves everything.
pub trait ApprovalHandler: Send + Sync {
    fn review(&self, agent_id: &str, command: &str) -> Decision;
}

pub struct AutoApprove;

impl ApprovalHandler for AutoApprove {
    fn review(&self, _agent_id: &str, _command: &str) -> Decision {
        Decision::Approve
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_template: String,
    pub instance_template: String,
    pub timeout_template: String,
    pub format_error_template: String,
    pub action_observation_template: String,
    /// Model-call ceiling across the hierarchy; 0 disables the check.
    pub step_limit: u64,
    /// Cost ceiling across the hierarchy; 0.0 disables the check.
    pub cost_limit: f64,
    /// Consecutive format failures tolerated before escalating.
    pub format_error_limit: u32,
    /// Consecutive execution timeouts tolerated before escalating.
    pub timeout_limit: u32,
    /// Initial mode; at run time the shared cell is authoritative.
    pub mode: Mode,
    /// Regex patterns (matched from the start of the command) that never
    /// need confirmation in `confirm` mode.
    pub whitelist_actions: Vec<String>,
    /// Open extension map absorbing descriptor metadata overrides.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            system_template: "You are a helpful assistant that can interact with a computer to solve tasks.".to_string(),
            instance_template: "Your task: {{ task }}. Please reply with a single shell command in triple backticks. \
                To finish, the first line of the output of the shell command must be 'COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT'."
                .to_string(),
            timeout_template: "The last command <command>{{ action }}</command> timed out and has been killed.\n\
                The output of the command was:\n<output>\n{{ output }}\n</output>\n\
                Please try another command and make sure to avoid those requiring interactive input."
                .to_string(),
            format_error_template: "No valid action found in your reply. \
                Please provide a shell command in triple backticks."
                .to_string(),
            action_observation_template:
                "<returncode>{{ returncode }}</returncode>\n<output>\n{{ output }}</output>"
                    .to_string(),
            step_limit: 0,
            cost_limit: 3.0,
            format_error_limit: 3,
            timeout_limit: 3,
            mode: Mode::default(),
            whitelist_actions: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl AgentConfig {
    /// Overlay descriptor metadata onto this config. Unknown keys land in
    /// the flattened extension map instead of failing the merge.
    pub fn merged_with(&self, overrides: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            for (key, val) in overrides {
                map.insert(key.clone(), val.clone());
            }
        }
        serde_json::from_value(value)
    }
}

/// Terminal result of a run. The message is always the text of the signal
/// that ended the loop and is always the last entry of the history.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub message: String,
    pub submission: Option<String>,
}

struct SpawnDirective {
    name: String,
    task: String,
}

/// The agent coordinator: owns one conversation, drives the
/// query-execute-observe loop to a terminal state, and delegates to child
/// coordinators on spawn triggers.
pub struct Agent {
    pub config: AgentConfig,
    messages: Vec<Message>,
    model: Arc<dyn Provider>,
    env: Arc<dyn Environment>,
    registry: Arc<SubagentRegistry>,
    approval: Arc<dyn ApprovalHandler>,
    mode: ModeCell,
    interrupt: InterruptHandle,
    agent_id: String,
    child_count: u64,
    steps: u64,
    cost: f64,
    format_error_streak: u32,
    timeout_streak: u32,
    extra_template_vars: Map<String, Value>,
}

impl Agent {
    pub fn new(model: Arc<dyn Provider>, env: Arc<dyn Environment>, config: AgentConfig) -> Self {
        let mode = ModeCell::new(config.mode);
        Agent {
            config,
            messages: Vec::new(),
            model,
            env,
            registry: Arc::new(SubagentRegistry::empty()),
            approval: Arc::new(AutoApprove),
            mode,
            interrupt: InterruptHandle::new(),
            agent_id: ROOT_AGENT_ID.to_string(),
            child_count: 0,
            steps: 0,
            cost: 0.0,
            format_error_streak: 0,
            timeout_streak: 0,
            extra_template_vars: Map::new(),
        }
    }

    pub fn with_registry(mut self, registry: Arc<SubagentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_approval(mut self, approval: Arc<dyn ApprovalHandler>) -> Self {
        self.approval = approval;
        self
    }

    /// Handle external controllers use to request cancellation; observed
    /// at the top of the next step.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// The hierarchy's shared mode cell.
    pub fn mode_cell(&self) -> ModeCell {
        self.mode.clone()
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Steps taken by this agent instance (children count their own).
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Cost accumulated by this agent instance's own turns.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    /// Ledger totals across the whole hierarchy.
    pub fn model_stats(&self) -> ModelStats {
        self.model.stats()
    }

    /// Run step() until a terminal signal fires. The signal's message is
    /// appended to history exactly once before returning, so the final
    /// history entry always explains why the run stopped.
    pub async fn run(&mut self, task: &str) -> RunOutcome {
        self.extra_template_vars
            .insert("task".to_string(), json!(task));
        self.messages.clear();
        self.steps = 0;
        self.cost = 0.0;
        self.format_error_streak = 0;
        self.timeout_streak = 0;

        if let Err(signal) = self.seed_history() {
            return self.finish(signal);
        }

        loop {
            match self.step().await {
                Ok(()) => {}
                Err(signal) if !signal.is_terminal() => {
                    self.add_message(Message::user().with_text(signal.to_string()));
                }
                Err(signal) => return self.finish(signal),
            }
        }
    }

    fn seed_history(&mut self) -> Result<(), FlowInterrupt> {
        let system = self.render(&self.config.system_template)?;
        self.add_message(Message::system().with_text(system));
        let instance = self.render(&self.config.instance_template)?;
        self.add_message(Message::user().with_text(instance));
        Ok(())
    }

    fn finish(&mut self, signal: FlowInterrupt) -> RunOutcome {
        let status = signal.exit_status().unwrap_or(ExitStatus::Error);
        let mut message = signal.to_string();
        if message.is_empty() {
            message = status.to_string();
        }
        self.add_message(Message::user().with_text(message.clone()));

        let submission = match signal {
            FlowInterrupt::Submitted(text) => Some(text),
            _ => None,
        };
        info!(agent = %self.agent_id, %status, steps = self.steps, "run finished");
        RunOutcome {
            status,
            message,
            submission,
        }
    }

    /// Query the model, execute the extracted actions, observe.
    async fn step(&mut self) -> Result<(), FlowInterrupt> {
        if self.interrupt.is_interrupted() {
            return Err(FlowInterrupt::Interrupted("Interrupted by user.".to_string()));
        }
        let turn = self.query().await?;
        self.observe(turn).await
    }

    async fn query(&mut self) -> Result<ModelTurn, FlowInterrupt> {
        self.check_limits()?;

        let turn = match self.model.query(&self.messages).await {
            Ok(turn) => turn,
            Err(ProviderError::Malformed(detail)) => return Err(self.format_failure(detail)),
            Err(other) => return Err(FlowInterrupt::Fatal(other.to_string())),
        };

        let commands: Vec<String> = turn.actions.iter().map(|a| a.command.clone()).collect();
        let message = turn
            .message
            .clone()
            .with_extra("actions", json!(commands))
            .with_extra("cost", json!(turn.cost));
        self.add_message(message);

        self.steps += 1;
        self.cost += turn.cost;
        Ok(turn)
    }

    async fn observe(&mut self, turn: ModelTurn) -> Result<(), FlowInterrupt> {
        if turn.actions.is_empty() {
            let message = self.render(&self.config.format_error_template)?;
            return Err(self.format_failure(message));
        }
        self.format_error_streak = 0;

        for action in &turn.actions {
            let Some(output) = self.perform(action).await? else {
                continue;
            };
            self.check_finished(&output.output)?;
            let observation = self.render_observation(&output)?;
            self.add_message(
                Message::user()
                    .with_text(observation)
                    .with_extra("returncode", json!(output.returncode))
                    .with_extra("duration_ms", json!(output.duration_ms))
                    .with_extra("elided_chars", json!(output.elided_chars)),
            );
        }
        Ok(())
    }

    /// Execute one action: spawn triggers never reach the environment, and
    /// the confirmation gate may skip the action entirely (`None`).
    async fn perform(
        &mut self,
        action: &Action,
    ) -> Result<Option<ExecutionOutput>, FlowInterrupt> {
        if let Some(directive) = parse_spawn(&action.command) {
            return Ok(Some(self.delegate(directive).await?));
        }

        if self.should_confirm(&action.command) {
            match self.approval.review(&self.agent_id, &action.command) {
                Decision::Approve => {}
                Decision::Reject(comment) => {
                    self.add_message(Message::user().with_text(format!(
                        "Command not executed. The user rejected your command with the following message: {comment}"
                    )));
                    return Ok(None);
                }
                Decision::Interrupt => {
                    return Err(FlowInterrupt::Interrupted("Interrupted by user.".to_string()))
                }
            }
        }

        match self.env.execute(&action.command).await {
            Ok(output) => {
                self.timeout_streak = 0;
                Ok(Some(output))
            }
            Err(EnvironmentError::Timeout {
                timeout_secs,
                partial_output,
            }) => {
                self.timeout_streak += 1;
                if self.timeout_streak > self.config.timeout_limit {
                    return Err(FlowInterrupt::LimitsExceeded(format!(
                        "Exceeded {} consecutive execution timeouts.",
                        self.config.timeout_limit
                    )));
                }
                let mut context = self.template_context();
                context.insert("action", &action.command);
                context.insert("output", &partial_output);
                context.insert("timeout", &timeout_secs);
                let message = render_template(&self.config.timeout_template, &context)
                    .map_err(|e| FlowInterrupt::Fatal(format!("template rendering failed: {e}")))?;
                Err(FlowInterrupt::ExecutionTimeout(message))
            }
            Err(other) => Err(FlowInterrupt::Fatal(other.to_string())),
        }
    }

    /// Resolve a spawn directive into the observation for this action.
    /// Invalid directives come back as corrective observations; a valid
    /// one runs a child coordinator to its terminal state.
    async fn delegate(
        &mut self,
        directive: SpawnDirective,
    ) -> Result<ExecutionOutput, FlowInterrupt> {
        if directive.name.is_empty() {
            debug!(agent = %self.agent_id, "spawn trigger without a subagent name");
            return Ok(ExecutionOutput::new(
                format!(
                    "Spawn request is missing a subagent name. \
                     Use {SPAWN_MARKER}{SPAWN_SEPARATOR}<name> with a name from the registry:\n{}",
                    self.registry.listing()
                ),
                1,
            ));
        }

        let Some(descriptor) = self.registry.lookup(&directive.name).cloned() else {
            return Ok(ExecutionOutput::new(
                format!(
                    "Subagent '{}' not found in the registry. Available subagents:\n{}",
                    directive.name,
                    self.registry.listing()
                ),
                1,
            ));
        };

        self.child_count += 1;
        let child_id = format!("{}{}S{}", self.agent_id, SPAWN_SEPARATOR, self.child_count);
        info!(parent = %self.agent_id, child = %child_id, subagent = %descriptor.name, "spawning subagent");

        let mut config = match self.config.merged_with(&descriptor.config_overrides()) {
            Ok(config) => config,
            Err(e) => {
                return Ok(ExecutionOutput::new(
                    format!(
                        "Subagent '{}' has invalid configuration overrides: {e}",
                        descriptor.name
                    ),
                    1,
                ))
            }
        };
        config.system_template = descriptor.prompt.clone();

        let mut child = Agent {
            config,
            messages: Vec::new(),
            model: Arc::clone(&self.model),
            env: Arc::clone(&self.env),
            registry: Arc::clone(&self.registry),
            approval: Arc::clone(&self.approval),
            mode: self.mode.clone(),
            interrupt: self.interrupt.clone(),
            agent_id: child_id.clone(),
            child_count: 0,
            steps: 0,
            cost: 0.0,
            format_error_streak: 0,
            timeout_streak: 0,
            extra_template_vars: Map::new(),
        };

        let outcome = Box::pin(child.run(&directive.task)).await;
        info!(child = %child_id, status = %outcome.status, "subagent finished");

        match outcome.status {
            ExitStatus::Submitted => {
                let submission = outcome.submission.unwrap_or_default();
                // A submission that itself leads with the completion
                // marker finishes this agent too.
                self.check_finished(&submission)?;
                Ok(ExecutionOutput::new(
                    format!("Agent {child_id} returned:\n{submission}"),
                    0,
                ))
            }
            status => Ok(ExecutionOutput::new(
                format!("Agent {child_id} failed with {status}: {}", outcome.message),
                1,
            )),
        }
    }

    fn should_confirm(&self, command: &str) -> bool {
        match self.mode.get() {
            Mode::Yolo => false,
            Mode::Human => true,
            Mode::Confirm => !self.config.whitelist_actions.iter().any(|pattern| {
                Regex::new(pattern)
                    .ok()
                    .and_then(|re| re.find(command))
                    .map(|m| m.start() == 0)
                    .unwrap_or(false)
            }),
        }
    }

    fn check_limits(&self) -> Result<(), FlowInterrupt> {
        let stats = self.model.stats();
        let steps_hit = self.config.step_limit > 0 && stats.n_calls >= self.config.step_limit;
        let cost_hit = self.config.cost_limit > 0.0 && stats.cost >= self.config.cost_limit;
        if steps_hit || cost_hit {
            return Err(FlowInterrupt::LimitsExceeded(format!(
                "Limits exceeded: {} model calls (limit {}), ${:.2} spent (limit ${:.2}).",
                stats.n_calls, self.config.step_limit, stats.cost, self.config.cost_limit
            )));
        }
        Ok(())
    }

    fn format_failure(&mut self, message: String) -> FlowInterrupt {
        self.format_error_streak += 1;
        if self.format_error_streak > self.config.format_error_limit {
            return FlowInterrupt::LimitsExceeded(format!(
                "Exceeded {} consecutive format errors. Last error: {message}",
                self.config.format_error_limit
            ));
        }
        FlowInterrupt::FormatError(message)
    }

    /// Raises `Submitted` when the output's first line is the completion
    /// marker; the remaining lines are the submission.
    fn check_finished(&self, output: &str) -> Result<(), FlowInterrupt> {
        let mut lines = output.trim_start().split_inclusive('\n');
        if let Some(first) = lines.next() {
            if first.trim() == COMPLETION_MARKER {
                return Err(FlowInterrupt::Submitted(lines.collect()));
            }
        }
        Ok(())
    }

    fn render(&self, template: &str) -> Result<String, FlowInterrupt> {
        render_template(template, &self.template_context())
            .map_err(|e| FlowInterrupt::Fatal(format!("template rendering failed: {e}")))
    }

    fn render_observation(&self, output: &ExecutionOutput) -> Result<String, FlowInterrupt> {
        let mut context = self.template_context();
        context.insert("output", &output.output);
        context.insert("returncode", &output.returncode);
        render_template(&self.config.action_observation_template, &context)
            .map_err(|e| FlowInterrupt::Fatal(format!("template rendering failed: {e}")))
    }

    /// The bundle exposed to every template: config fields, environment
    /// state, registry listing and live counters.
    fn template_context(&self) -> Context {
        let mut context = Context::new();
        if let Ok(Value::Object(map)) = serde_json::to_value(&self.config) {
            for (key, value) in map {
                context.insert(key, &value);
            }
        }
        for (key, value) in self.env.template_vars() {
            context.insert(key, &value);
        }
        for (key, value) in &self.extra_template_vars {
            context.insert(key.as_str(), value);
        }
        let stats = self.model.stats();
        context.insert("step", &stats.n_calls);
        context.insert("cost", &stats.cost);
        context.insert("agent_id", &self.agent_id);
        context.insert("current_mode", &self.mode.get().to_string());
        context.insert("subagents", &self.registry.listing());
        context
    }

    fn add_message(&mut self, message: Message) {
        debug!(agent = %self.agent_id, role = ?message.role, "appending message");
        self.messages.push(message);
    }
}

fn parse_spawn(command: &str) -> Option<SpawnDirective> {
    let first_line = command.lines().next().unwrap_or("");
    let rest = first_line.strip_prefix(SPAWN_MARKER)?;
    let name = if rest.is_empty() {
        String::new()
    } else if let Some(name) = rest.strip_prefix(SPAWN_SEPARATOR) {
        name.trim().to_string()
    } else {
        // Marker-prefixed but a different token; not a spawn.
        return None;
    };
    let task = command.lines().skip(1).collect::<Vec<_>>().join("\n");
    Some(SpawnDirective { name, task })
}
