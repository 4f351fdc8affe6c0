//! Final task report
//!
//! Renders `outputs/result.md` from the finished instance: summary, a
//! per-node table with status and duration, truncated outputs, and the
//! terminal error when there is one.

use handlebars::Handlebars;
use serde_json::{Value, json};

use hubstore::DataDir;

use crate::domain::Task;
use crate::workflow::instance::WorkflowInstance;
use crate::workflow::model::Workflow;

const RESULT_TEMPLATE: &str = r#"# {{title}}

- Status: **{{status}}**
- Workflow: {{workflow_name}} ({{node_count}} nodes)
{{#if duration}}- Duration: {{duration}}
{{/if}}{{#if error}}- Error: {{error}}
{{/if}}
## Summary

{{summary}}

## Nodes

| Node | Type | Status | Attempts | Duration |
|------|------|--------|----------|----------|
{{#each nodes}}| {{id}} | {{type}} | {{status}} | {{attempts}} | {{duration}} |
{{/each}}
{{#if outputs}}
## Outputs
{{#each outputs}}

### {{id}}

{{text}}
{{/each}}
{{/if}}"#;

/// Cap on rendered per-node output
const OUTPUT_EXCERPT_CHARS: usize = 400;

/// Render the final report markdown
pub fn render_result(task: &Task, workflow: &Workflow, instance: &WorkflowInstance) -> String {
    let mut node_rows = Vec::new();
    let mut output_sections = Vec::new();

    for node in &workflow.nodes {
        let state = instance.node_state(&node.id);
        let status = state.map(|s| s.status.to_string()).unwrap_or_else(|| "unknown".to_string());
        let attempts = state.map(|s| s.attempts).unwrap_or(0);
        let duration = state
            .and_then(|s| s.duration_ms)
            .map(format_duration)
            .unwrap_or_else(|| "-".to_string());

        node_rows.push(json!({
            "id": node.id,
            "type": node.kind.type_name(),
            "status": status,
            "attempts": attempts,
            "duration": duration,
        }));

        if let Some(text) = instance.outputs.get(&node.id).and_then(output_text)
            && !text.trim().is_empty()
        {
            output_sections.push(json!({
                "id": node.id,
                "text": truncate_output(&text),
            }));
        }
    }

    let total_duration = instance
        .started_at
        .zip(instance.completed_at)
        .map(|(start, end)| format_duration((end - start).num_milliseconds().max(0) as u64));

    let handlebars = Handlebars::new();
    handlebars
        .render_template(
            RESULT_TEMPLATE,
            &json!({
                "title": task.title,
                "status": instance.status.to_string(),
                "workflow_name": workflow.name,
                "node_count": workflow.nodes.len(),
                "duration": total_duration,
                "error": instance.error,
                "summary": summary_text(instance),
                "nodes": node_rows,
                "outputs": output_sections,
            }),
        )
        .unwrap_or_else(|e| format!("# {}\n\nreport rendering failed: {}", task.title, e))
}

/// Write the report to `outputs/result.md`
pub fn save_result(data: &DataDir, task: &Task, workflow: &Workflow, instance: &WorkflowInstance) -> eyre::Result<String> {
    let rendered = render_result(task, workflow, instance);
    let path = data.result_file(&task.id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, &rendered)?;
    Ok(rendered)
}

/// The one-paragraph summary: a direct answer when present, otherwise the
/// last non-empty task output, otherwise the status line
pub fn summary_text(instance: &WorkflowInstance) -> String {
    if let Some(answer) = instance.variables.get("directAnswer").and_then(Value::as_str) {
        return answer.to_string();
    }

    // Latest node output by completion time
    let mut settled: Vec<(&String, &Value)> = instance
        .outputs
        .iter()
        .filter(|(id, _)| {
            instance
                .node_state(id)
                .map(|s| s.completed_at.is_some())
                .unwrap_or(false)
        })
        .collect();
    settled.sort_by_key(|(id, _)| instance.node_state(id).and_then(|s| s.completed_at));

    for (_, output) in settled.iter().rev() {
        if let Some(text) = output_text(output)
            && !text.trim().is_empty()
        {
            return truncate_output(&text);
        }
    }

    format!("Workflow finished with status {}.", instance.status)
}

fn output_text(output: &Value) -> Option<String> {
    match output.get("_raw") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None => None,
    }
}

fn truncate_output(text: &str) -> String {
    if text.chars().count() <= OUTPUT_EXCERPT_CHARS {
        return text.to_string();
    }
    let excerpt: String = text.chars().take(OUTPUT_EXCERPT_CHARS).collect();
    format!("{}…", excerpt)
}

fn format_duration(ms: u64) -> String {
    if ms < 1_000 {
        format!("{}ms", ms)
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{Edge, Node, NodeKind, TaskNodeConfig};
    use serde_json::json;
    use tempfile::tempdir;

    fn fixture() -> (Task, Workflow, WorkflowInstance) {
        let task = Task::with_id("t1", "Ship feature", "Ship the feature");
        let workflow = Workflow {
            id: "wf".to_string(),
            task_id: "t1".to_string(),
            name: "ship".to_string(),
            nodes: vec![
                Node {
                    id: "start".to_string(),
                    name: "Start".to_string(),
                    kind: NodeKind::Start,
                },
                Node {
                    id: "build".to_string(),
                    name: "Build".to_string(),
                    kind: NodeKind::Task(TaskNodeConfig {
                        prompt: "build".to_string(),
                        ..Default::default()
                    }),
                },
                Node {
                    id: "end".to_string(),
                    name: "End".to_string(),
                    kind: NodeKind::End,
                },
            ],
            edges: vec![Edge::new("start", "build"), Edge::new("build", "end")],
            ..Default::default()
        };

        let mut instance = WorkflowInstance::for_workflow(&workflow);
        for id in ["start", "build", "end"] {
            instance.mark_node_running(id);
            instance.mark_node_done(id, None);
        }
        instance
            .outputs
            .insert("build".to_string(), json!({"_raw": "built 3 crates"}));
        instance.status = crate::workflow::instance::InstanceStatus::Completed;
        instance.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(90));
        instance.completed_at = Some(chrono::Utc::now());
        (task, workflow, instance)
    }

    #[test]
    fn test_render_contains_sections() {
        let (task, workflow, instance) = fixture();
        let report = render_result(&task, &workflow, &instance);

        assert!(report.starts_with("# Ship feature"));
        assert!(report.contains("Status: **completed**"));
        assert!(report.contains("| build | task | done |"));
        assert!(report.contains("built 3 crates"));
        assert!(report.contains("1m30s"));
    }

    #[test]
    fn test_summary_prefers_direct_answer() {
        let (_, _, mut instance) = fixture();
        instance
            .variables
            .insert("directAnswer".to_string(), json!("just bump the version"));
        assert_eq!(summary_text(&instance), "just bump the version");
    }

    #[test]
    fn test_summary_uses_last_output() {
        let (_, _, instance) = fixture();
        assert_eq!(summary_text(&instance), "built 3 crates");
    }

    #[test]
    fn test_long_output_truncated() {
        let (task, workflow, mut instance) = fixture();
        let long = "x".repeat(2_000);
        instance.outputs.insert("build".to_string(), json!({"_raw": long}));

        let report = render_result(&task, &workflow, &instance);
        assert!(report.contains('…'));
        assert!(!report.contains(&"x".repeat(500)));
    }

    #[test]
    fn test_error_rendered() {
        let (task, workflow, mut instance) = fixture();
        instance.status = crate::workflow::instance::InstanceStatus::Failed;
        instance.error = Some("node build failed".to_string());

        let report = render_result(&task, &workflow, &instance);
        assert!(report.contains("Error: node build failed"));
        assert!(report.contains("Status: **failed**"));
    }

    #[test]
    fn test_save_result_writes_file() {
        let temp = tempdir().unwrap();
        let data = DataDir::new(temp.path());
        let (task, workflow, instance) = fixture();

        save_result(&data, &task, &workflow, &instance).unwrap();
        let content = std::fs::read_to_string(data.result_file("t1")).unwrap();
        assert!(content.contains("Ship feature"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(250), "250ms");
        assert_eq!(format_duration(2_500), "2.5s");
        assert_eq!(format_duration(92_000), "1m32s");
    }
}
