//! Workflow Parser
//!
//! Loads workflow and template definitions from YAML. Workflows are
//! validated after parsing; ids missing from the file are generated.

use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use super::model::Workflow;
use super::template::WorkflowTemplate;
use super::validator::validate_workflow;
use crate::error::ConfigError;

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use conductor::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("research.yaml")?;
///     println!("Loaded {} steps", workflow.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, ConfigError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = read_file(path)?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    parse_workflow(&yaml_content)
}

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(yaml: &str) -> Result<Workflow, ConfigError> {
    let mut workflow: Workflow = serde_yaml::from_str(yaml)?;
    workflow.refresh_capabilities();

    validate_workflow(&workflow).map_err(|errors| {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        ConfigError::Invalid(messages.join("\n"))
    })?;

    info!(
        "Parsed workflow '{}' ({}): {} steps",
        workflow.name,
        workflow.id,
        workflow.steps.len()
    );
    Ok(workflow)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TemplateFile {
    Wrapped { templates: Vec<WorkflowTemplate> },
    List(Vec<WorkflowTemplate>),
}

/// Loads templates from a YAML file holding either a list of templates or
/// a `templates:` key.
pub fn load_templates(path: impl AsRef<Path>) -> Result<Vec<WorkflowTemplate>, ConfigError> {
    let path = path.as_ref();
    info!("Loading templates from: {}", path.display());
    parse_templates(&read_file(path)?)
}

/// Parses templates from YAML text.
pub fn parse_templates(yaml: &str) -> Result<Vec<WorkflowTemplate>, ConfigError> {
    let templates = match serde_yaml::from_str::<TemplateFile>(yaml)? {
        TemplateFile::Wrapped { templates } => templates,
        TemplateFile::List(templates) => templates,
    };

    for template in &templates {
        if template.steps.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Template '{}' has no steps",
                template.name
            )));
        }
    }

    info!("Parsed {} templates", templates.len());
    Ok(templates)
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{Condition, ExecutionMode, RetryTrigger};
    use std::io::Write;
    use tempfile::NamedTempFile;

    const WORKFLOW_YAML: &str = r#"
id: wf-research
name: research
description: gather and summarize
steps:
  - id: gather
    capability: search
    parameters:
      query: rust
  - id: summarize_a
    capability: summarize
    execution_mode: parallel
    parallel_group: summaries
  - id: summarize_b
    capability: summarize
    execution_mode: parallel
    parallel_group: summaries
  - id: report
    capability: write
    execution_mode: conditional
    conditions:
      - kind: success
        target: summarize_a
    retry_policy:
      max_retries: 1
      backoff_factor: 0.5
      retry_on: [exception]
"#;

    #[test]
    fn test_parse_workflow() {
        let workflow = parse_workflow(WORKFLOW_YAML).unwrap();

        assert_eq!(workflow.id, "wf-research");
        assert_eq!(workflow.steps.len(), 4);
        assert_eq!(workflow.steps[1].execution_mode, ExecutionMode::Parallel);
        assert_eq!(workflow.steps[3].conditions, vec![Condition::success("summarize_a")]);
        assert!(workflow.steps[3]
            .retry_policy
            .retries_on(RetryTrigger::Exception));
        assert!(!workflow.steps[3].retry_policy.retries_on(RetryTrigger::Failure));
        assert!(workflow.required_capabilities.contains("write"));
    }

    #[test]
    fn test_parse_invalid_workflow() {
        let yaml = r#"
name: broken
steps:
  - id: a
    capability: search
  - id: a
    capability: search
"#;
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("Duplicate step ID"));
    }

    #[test]
    fn test_parse_malformed_yaml() {
        let err = parse_workflow("steps: [unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_workflow_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(WORKFLOW_YAML.as_bytes()).unwrap();

        let workflow = load_workflow(file.path()).unwrap();
        assert_eq!(workflow.name, "research");
    }

    #[test]
    fn test_load_workflow_missing_file() {
        let err = load_workflow("/nonexistent/workflow.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_parse_templates_both_shapes() {
        let wrapped = r#"
templates:
  - name: single
    steps:
      - id: s
        capability: search
        parameters:
          query: "{topic}"
"#;
        let templates = parse_templates(wrapped).unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].steps[0].parameters["query"], "{topic}");

        let list = r#"
- name: a
  steps:
    - id: s
      capability: search
- name: b
  steps:
    - id: t
      capability: write
"#;
        assert_eq!(parse_templates(list).unwrap().len(), 2);
    }

    #[test]
    fn test_parse_template_without_steps() {
        let yaml = "- name: empty\n  steps: []\n";
        assert!(matches!(
            parse_templates(yaml).unwrap_err(),
            ConfigError::Invalid(_)
        ));
    }
}
