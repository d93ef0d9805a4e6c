//! Graph validator
//!
//! Checks a workflow before anything runs and reports every problem at
//! once: per-step required fields, conflicting kinds, duplicate names,
//! loop settings, parallel group collisions and dependency cycles.

use super::orchestrator::plan_loops;
use super::variables::as_var_ref;
use crate::config::{
    AgenticLoopConfig, NO_INPUT, STDIN, StepConfig, StepKind, ValidationError, ValidationErrors,
    WorkflowConfig,
};
use crate::template::TemplateEngine;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Where a step sits, which decides the fields it needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Sequential, parallel or deferred
    TopLevel,
    /// Inside a loop, chained from the previous sub-step
    LoopStep,
}

/// Validate a workflow, collecting every problem found
pub fn validate(workflow: &WorkflowConfig) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::default();
    let templates = TemplateEngine::new();

    for (_, step) in workflow.all_steps() {
        check_step(step, Placement::TopLevel, &templates, &mut errors);
    }
    check_duplicates(workflow.all_steps().into_iter().map(|(_, s)| s), &mut errors);

    if let Some(ref config) = workflow.agentic_loop {
        check_loop("agentic_loop", config, &templates, &mut errors);
    }
    for (name, config) in &workflow.loops {
        check_loop(name, config, &templates, &mut errors);
    }

    check_parallel_groups(workflow, &mut errors);
    check_cycles(workflow, &mut errors);

    if let Err(e) = plan_loops(workflow) {
        errors.push(ValidationError::LoopDependency {
            message: e.to_string(),
        });
    }

    errors.into_result()
}

fn check_step(
    step: &StepConfig,
    placement: Placement,
    templates: &TemplateEngine,
    errors: &mut ValidationErrors,
) {
    let name = if step.name.is_empty() {
        "<unnamed>".to_string()
    } else {
        step.name.clone()
    };

    if step.name.is_empty() {
        errors.push(ValidationError::MissingField {
            step: name.clone(),
            kind: step.kind().label(),
            field: "name",
        });
    }

    let kinds = step.declared_kinds();
    if kinds.len() > 1 {
        errors.push(ValidationError::ConflictingKinds {
            step: name.clone(),
            kinds: kinds.into_iter().map(String::from).collect(),
        });
        return;
    }

    let mut missing = |kind: &'static str, field: &'static str, present: bool| {
        if !present {
            errors.push(ValidationError::MissingField {
                step: name.clone(),
                kind,
                field,
            });
        }
    };

    match step.kind() {
        StepKind::Standard => {
            missing("standard", "model", step.model.is_some());
            missing("standard", "action", step.action.is_some());
            if placement == Placement::TopLevel {
                missing("standard", "input", step.input.is_some());
                missing("standard", "output", step.output.is_some());
            }
        }
        StepKind::Api(api) => {
            missing("api", "model", api.model.is_some());
            missing("api", "action", api.action.is_some());
        }
        StepKind::Generate(generate) => {
            missing("generate", "model", generate.model.is_some());
            missing("generate", "action", generate.action.is_some());
            missing("generate", "output", generate.output.is_some());
        }
        StepKind::Process(process) => {
            missing("process", "workflow", process.workflow.is_some());
        }
        StepKind::RepoIndex(_) => {}
        StepKind::InlineLoop(config) => {
            check_loop(&name, config, templates, errors);
        }
    }

    for text in [step.action.as_deref(), step.model.as_deref()]
        .into_iter()
        .flatten()
    {
        if let Err(e) = templates.validate(text) {
            errors.push(ValidationError::InvalidTemplate {
                step: name.clone(),
                message: e.to_string(),
            });
        }
    }
}

fn check_loop(
    name: &str,
    config: &AgenticLoopConfig,
    templates: &TemplateEngine,
    errors: &mut ValidationErrors,
) {
    for message in config.exit_problems() {
        errors.push(ValidationError::InvalidLoop {
            loop_name: name.to_string(),
            message,
        });
    }
    if config.steps.is_empty() {
        errors.push(ValidationError::InvalidLoop {
            loop_name: name.to_string(),
            message: "loop has no steps".into(),
        });
    }
    for step in &config.steps {
        check_step(step, Placement::LoopStep, templates, errors);
    }
    check_duplicates(config.steps.iter(), errors);
}

fn check_duplicates<'a>(steps: impl Iterator<Item = &'a StepConfig>, errors: &mut ValidationErrors) {
    let mut seen = HashSet::new();
    for step in steps {
        if !step.name.is_empty() && !seen.insert(step.name.as_str()) {
            errors.push(ValidationError::DuplicateStep {
                step: step.name.clone(),
            });
        }
    }
}

/// Normalized key for an output or input reference
fn reference_key(reference: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() || reference == STDIN || reference == NO_INPUT {
        return None;
    }
    if let Some(name) = as_var_ref(reference) {
        return Some(format!("${}", name));
    }
    Some(reference.strip_prefix("./").unwrap_or(reference).to_string())
}

fn produced_keys(step: &StepConfig) -> Vec<String> {
    step.produced_outputs()
        .iter()
        .filter_map(|o| reference_key(o))
        .collect()
}

fn consumed_keys(step: &StepConfig) -> Vec<String> {
    step.input
        .as_ref()
        .map(|i| i.references().into_iter().filter_map(reference_key).collect())
        .unwrap_or_default()
}

/// Within a group: no two members write the same output, none reads another's output
fn check_parallel_groups(workflow: &WorkflowConfig, errors: &mut ValidationErrors) {
    for (group, g) in &workflow.parallel {
        let mut producers: BTreeMap<String, &str> = BTreeMap::new();
        for step in &g.steps {
            for output in produced_keys(step) {
                match producers.get(&output) {
                    Some(first) if *first != step.name => {
                        errors.push(ValidationError::OutputCollision {
                            group: group.clone(),
                            output: output.clone(),
                            first: first.to_string(),
                            second: step.name.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        producers.insert(output, &step.name);
                    }
                }
            }
        }
        for step in &g.steps {
            for input in consumed_keys(step) {
                if let Some(producer) = producers.get(&input)
                    && *producer != step.name
                {
                    errors.push(ValidationError::IntraGroupDependency {
                        group: group.clone(),
                        step: step.name.clone(),
                        output: input,
                        producer: producer.to_string(),
                    });
                }
            }
        }
    }
}

/// Build consumer -> producer edges and report any cycle
///
/// Steps are taken in run order (parallel groups, then sequential steps).
/// An input depends on the nearest earlier producer of its key; only when
/// nothing earlier writes the key do later producers count.
fn check_cycles(workflow: &WorkflowConfig, errors: &mut ValidationErrors) {
    let mut nodes: Vec<&StepConfig> = Vec::new();
    for g in workflow.parallel.values() {
        nodes.extend(g.steps.iter());
    }
    nodes.extend(workflow.steps.iter());

    let mut producers: HashMap<String, Vec<(usize, &str)>> = HashMap::new();
    for (position, step) in nodes.iter().copied().enumerate() {
        for output in produced_keys(step) {
            producers.entry(output).or_default().push((position, step.name.as_str()));
        }
    }

    let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (position, step) in nodes.iter().copied().enumerate() {
        let deps = edges.entry(step.name.as_str()).or_default();
        for input in consumed_keys(step) {
            let Some(candidates) = producers.get(&input) else {
                continue;
            };
            let nearest_earlier = candidates.iter().rev().find(|(p, _)| *p < position);
            let resolved: Vec<&str> = match nearest_earlier {
                Some(&(_, name)) => vec![name],
                None => candidates
                    .iter()
                    .filter(|(p, _)| *p > position)
                    .map(|&(_, name)| name)
                    .collect(),
            };
            for producer in resolved {
                if producer != step.name && !deps.contains(&producer) {
                    deps.push(producer);
                }
            }
        }
    }

    if let Some(step) = find_cycle(&edges) {
        errors.push(ValidationError::CircularDependency {
            step: step.to_string(),
        });
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Depth-first search; returns the step revisited while still on the path
fn find_cycle<'a>(edges: &BTreeMap<&'a str, Vec<&'a str>>) -> Option<&'a str> {
    let mut marks: HashMap<&str, Mark> = edges.keys().map(|k| (*k, Mark::Unvisited)).collect();

    for &start in edges.keys() {
        if marks.get(start) != Some(&Mark::Unvisited) {
            continue;
        }
        // (node, index of next edge to follow)
        let mut stack: Vec<(&str, usize)> = vec![(start, 0)];
        marks.insert(start, Mark::OnPath);

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let deps = edges.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if let Some(&dep) = deps.get(top.1) {
                top.1 += 1;
                match marks.get(dep).copied().unwrap_or(Mark::Done) {
                    Mark::OnPath => return Some(dep),
                    Mark::Unvisited => {
                        marks.insert(dep, Mark::OnPath);
                        stack.push((dep, 0));
                    }
                    Mark::Done => {}
                }
            } else {
                marks.insert(node, Mark::Done);
                stack.pop();
            }
        }
    }
    None
}
