//! Plan phase - turn a task description into a workflow
//!
//! One backend call with the architect persona produces workflow JSON.
//! A failed parse retries once with a stricter instruction; if the model
//! answered in prose instead, the answer is wrapped in a minimal
//! start -> end workflow so the task still completes with output.

use std::sync::Arc;

use handlebars::Handlebars;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use hubstore::DataDir;

use crate::backend::{Backend, InvokeOptions};
use crate::config::Config;
use crate::domain::{Task, generate_id};
use crate::engine::persona_prompt;
use crate::events::record_conversation;
use crate::failure::FailureKb;
use crate::memory::MemoryEngine;
use crate::workflow::graph;
use crate::workflow::model::{Edge, Node, NodeKind, Workflow};

/// Planning prompt template
const PLANNING_TEMPLATE: &str = r#"{{persona}}

Design a workflow that accomplishes the task below. Respond with a single JSON
object and nothing else, using this shape:

{
  "name": "short workflow name",
  "description": "one sentence",
  "variables": {},
  "nodes": [
    {"id": "start", "type": "start"},
    {"id": "step1", "type": "task", "name": "...", "persona": "developer", "prompt": "..."},
    {"id": "end", "type": "end"}
  ],
  "edges": [
    {"from": "start", "to": "step1"},
    {"from": "step1", "to": "end"}
  ]
}

Available node types: start, end, task, parallel, join, condition, human,
delay (delayMs), schedule (at), switch (cases), assign (assignments),
script (expression, outputVar), loop (condition, maxIterations),
foreach (items, itemVar, indexVar). Edge conditions are expressions over
{outputs, variables, loopCounts, nodeStates}. There must be exactly one
start and one end node and every node must be reachable from start.
{{#if memories}}

Relevant notes from previous work:
{{#each memories}}
- {{this}}
{{/each}}
{{/if}}
{{#if pitfalls}}

Known failure patterns to avoid:
{{#each pitfalls}}
- {{this}}
{{/each}}
{{/if}}

Task: {{title}}

{{description}}"#;

const STRICT_RETRY_SUFFIX: &str = "\n\nYour previous response could not be used: {{error}}.\n\
Respond with ONLY the JSON object, no prose, no markdown fences.";

/// The plan-phase driver
pub struct Planner {
    data: DataDir,
    backend: Arc<dyn Backend>,
    memory: Option<Arc<MemoryEngine>>,
    failure_kb: FailureKb,
    model: Option<String>,
    timeout_ms: u64,
}

impl Planner {
    pub fn new(data: DataDir, backend: Arc<dyn Backend>, memory: Option<Arc<MemoryEngine>>, config: &Config) -> Self {
        Self {
            failure_kb: FailureKb::new(data.clone()),
            data,
            backend,
            memory,
            model: if config.backend.model.is_empty() {
                None
            } else {
                Some(config.backend.model.clone())
            },
            timeout_ms: config.backend.timeout_ms,
        }
    }

    /// Produce and validate a workflow for the task
    pub async fn plan(&self, task: &Task) -> eyre::Result<Workflow> {
        let prompt = self.build_prompt(task)?;
        record_conversation(&self.data, &task.id, "prompt", None, &prompt)?;

        let response = self.invoke(&prompt).await?;
        record_conversation(&self.data, &task.id, "response", None, &response)?;

        match self.parse_and_validate(task, &response) {
            Ok(workflow) => return Ok(workflow),
            Err(error) => {
                warn!(task_id = %task.id, %error, "plan: first attempt unusable, retrying stricter");

                let retry_prompt = format!("{}{}", prompt, STRICT_RETRY_SUFFIX.replace("{{error}}", &error));
                record_conversation(&self.data, &task.id, "prompt", None, &retry_prompt)?;
                let retry_response = self.invoke(&retry_prompt).await?;
                record_conversation(&self.data, &task.id, "response", None, &retry_response)?;

                match self.parse_and_validate(task, &retry_response) {
                    Ok(workflow) => return Ok(workflow),
                    Err(retry_error) => {
                        // A prose answer with no JSON at all is treated as a
                        // direct answer rather than a planning failure
                        if looks_like_direct_answer(&retry_response) {
                            info!(task_id = %task.id, "plan: wrapping direct answer workflow");
                            return Ok(direct_answer_workflow(task, &retry_response));
                        }
                        if looks_like_direct_answer(&response) {
                            info!(task_id = %task.id, "plan: wrapping first-response direct answer");
                            return Ok(direct_answer_workflow(task, &response));
                        }
                        Err(eyre::eyre!("planner produced no usable workflow: {}", retry_error))
                    }
                }
            }
        }
    }

    async fn invoke(&self, prompt: &str) -> eyre::Result<String> {
        let mut options = InvokeOptions::new(prompt.to_string());
        options.model = self.model.clone();
        options.stream = false;
        options.timeout_ms = self.timeout_ms;

        let invocation = self
            .backend
            .invoke(options, None)
            .await
            .map_err(|e| eyre::eyre!("planner backend call failed: {}", e))?;
        Ok(invocation.response)
    }

    fn build_prompt(&self, task: &Task) -> eyre::Result<String> {
        let memories = self
            .memory
            .as_ref()
            .map(|m| m.recall_for_prompt(&task.description, 5))
            .unwrap_or_default();
        let pitfalls = self.failure_kb.top_lessons(5);

        let handlebars = Handlebars::new();
        let rendered = handlebars.render_template(
            PLANNING_TEMPLATE,
            &json!({
                "persona": persona_prompt(Some("architect")),
                "title": task.title,
                "description": task.description,
                "memories": memories,
                "pitfalls": pitfalls,
            }),
        )?;
        Ok(rendered)
    }

    fn parse_and_validate(&self, task: &Task, response: &str) -> Result<Workflow, String> {
        let json = extract_workflow_json(response).ok_or_else(|| "no JSON object found in response".to_string())?;

        let mut workflow: Workflow =
            serde_json::from_value(json).map_err(|e| format!("workflow JSON did not parse: {}", e))?;

        if workflow.id.is_empty() {
            workflow.id = generate_id("wf", &workflow.name);
        }
        workflow.task_id = task.id.clone();
        if workflow.name.is_empty() {
            workflow.name = task.title.clone();
        }

        let errors = graph::validate(&workflow);
        if !errors.is_empty() {
            return Err(format!("workflow validation failed: {}", errors.join("; ")));
        }

        debug!(
            workflow_id = %workflow.id,
            nodes = workflow.nodes.len(),
            edges = workflow.edges.len(),
            "plan: workflow validated"
        );
        Ok(workflow)
    }

    /// Ask the backend for a better title when the current one is generic
    pub async fn improve_title(&self, task: &Task) -> Option<String> {
        if !title_is_generic(task) {
            return None;
        }

        let prompt = format!(
            "Suggest a concise title (at most eight words, no quotes) for this task:\n\n{}",
            task.description
        );
        let title = self.invoke(&prompt).await.ok()?;
        let title = title.lines().next()?.trim().trim_matches('"').to_string();
        if title.is_empty() || title.len() > 100 {
            return None;
        }
        Some(title)
    }
}

/// A title is generic when it is empty or just the truncated description
fn title_is_generic(task: &Task) -> bool {
    if task.title.trim().is_empty() {
        return true;
    }
    let prefix: String = task.description.chars().take(task.title.chars().count()).collect();
    task.title == prefix
}

/// Pull a workflow JSON object out of a model response: fenced block
/// first, then the first balanced top-level object
pub fn extract_workflow_json(response: &str) -> Option<Value> {
    // ```json fenced block
    if let Some(fence_start) = response.find("```json")
        && let Some(rest) = response.get(fence_start + 7..)
        && let Some(fence_end) = rest.find("```")
        && let Ok(value) = serde_json::from_str::<Value>(rest[..fence_end].trim())
    {
        return Some(value);
    }

    // First balanced top-level brace pair
    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, c) in response[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &response[start..=start + offset];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// A response counts as a direct answer when it holds prose and no JSON
/// object we could use
fn looks_like_direct_answer(response: &str) -> bool {
    !response.trim().is_empty() && extract_workflow_json(response).is_none()
}

/// Minimal start -> end workflow carrying a direct answer
pub fn direct_answer_workflow(task: &Task, answer: &str) -> Workflow {
    Workflow {
        id: generate_id("wf", &task.title),
        task_id: task.id.clone(),
        name: task.title.clone(),
        description: "direct answer".to_string(),
        variables: [
            ("directAnswer".to_string(), json!(answer)),
            ("isDirectAnswer".to_string(), json!(true)),
        ]
        .into_iter()
        .collect(),
        nodes: vec![
            Node {
                id: "start".to_string(),
                name: "Start".to_string(),
                kind: NodeKind::Start,
            },
            Node {
                id: "end".to_string(),
                name: "End".to_string(),
                kind: NodeKind::End,
            },
        ],
        edges: vec![Edge::new("start", "end")],
        created_at: chrono::Utc::now(),
    }
}
