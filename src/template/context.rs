//! Template context for variable resolution

use minijinja::value::{Enumerator, Object, ObjectRepr, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Context available to templates during rendering
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    /// CLI variables, addressable at top level (`{{ topic }}`)
    pub cli_vars: HashMap<String, String>,

    /// Workflow variables (`{{ vars.SUMMARY }}`)
    pub variables: HashMap<String, String>,

    /// Loop values (`{{ loop.iteration }}`)
    pub loop_vars: HashMap<String, String>,

    /// Outputs of completed steps (`{{ steps.fetch.output }}`)
    pub steps: HashMap<String, String>,

    /// Workflow name
    pub workflow: Option<String>,
}

impl TemplateContext {
    /// Create a new empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context with CLI variables
    pub fn with_cli_vars(cli_vars: HashMap<String, String>) -> Self {
        Self {
            cli_vars,
            ..Default::default()
        }
    }

    /// Workflow variables, usually a variable store snapshot
    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }

    /// Values of the innermost running loop
    pub fn with_loop_vars(mut self, loop_vars: HashMap<String, String>) -> Self {
        self.loop_vars = loop_vars;
        self
    }

    /// Record a step output
    pub fn add_step(&mut self, name: impl Into<String>, output: impl Into<String>) {
        self.steps.insert(name.into(), output.into());
    }

    /// Set the workflow name
    pub fn set_workflow(&mut self, name: impl Into<String>) {
        self.workflow = Some(name.into());
    }

    /// Convert to a minijinja Value for template rendering
    pub fn to_value(&self) -> Value {
        Value::from_object(ContextObject(self.clone()))
    }

    /// Known top-level names for error suggestions
    pub fn known_variables(&self) -> Vec<&str> {
        let mut vars = vec!["steps", "vars", "env", "workflow"];
        if !self.loop_vars.is_empty() {
            vars.push("loop");
        }
        vars.extend(self.cli_vars.keys().map(|k| k.as_str()));
        vars
    }
}

#[derive(Debug, Clone)]
struct ContextObject(TemplateContext);

impl fmt::Display for ContextObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TemplateContext")
    }
}

impl Object for ContextObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let key_str = key.as_str()?;
        match key_str {
            "steps" => Some(Value::from_object(StepsObject(self.0.steps.clone()))),
            "vars" => Some(Value::from_object(MapObject {
                label: "vars",
                entries: self.0.variables.clone(),
            })),
            "loop" if !self.0.loop_vars.is_empty() => Some(Value::from_object(MapObject {
                label: "loop",
                entries: self.0.loop_vars.clone(),
            })),
            "workflow" => self.0.workflow.as_ref().map(|w| Value::from(w.clone())),
            "env" => Some(Value::from_object(EnvObject)),
            other => self.0.cli_vars.get(other).map(|v| Value::from(v.clone())),
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        let mut keys: Vec<Value> = ["steps", "vars", "workflow", "env"]
            .iter()
            .map(|k| Value::from(*k))
            .collect();
        if !self.0.loop_vars.is_empty() {
            keys.push(Value::from("loop"));
        }
        keys.extend(self.0.cli_vars.keys().map(|k| Value::from(k.clone())));
        Enumerator::Values(keys)
    }
}

/// Object for accessing step outputs
#[derive(Debug, Clone)]
struct StepsObject(HashMap<String, String>);

impl fmt::Display for StepsObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "steps")
    }
}

impl Object for StepsObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let step_name = key.as_str()?;
        let output = self.0.get(step_name)?;
        Some(Value::from_object(StepOutputObject(output.clone())))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.0.keys().map(|k| Value::from(k.clone())).collect())
    }
}

/// A single step output; renders as its text
#[derive(Debug, Clone)]
struct StepOutputObject(String);

impl fmt::Display for StepOutputObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Object for StepOutputObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "output" => Some(Value::from(self.0.clone())),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["output"])
    }
}

/// String map exposed under a fixed name
#[derive(Debug, Clone)]
struct MapObject {
    label: &'static str,
    entries: HashMap<String, String>,
}

impl fmt::Display for MapObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl Object for MapObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let name = key.as_str()?;
        self.entries.get(name).map(|v| Value::from(v.clone()))
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Values(self.entries.keys().map(|k| Value::from(k.clone())).collect())
    }
}

/// Object for lazy environment variable access
#[derive(Debug, Clone, Copy)]
struct EnvObject;

impl fmt::Display for EnvObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "env")
    }
}

impl Object for EnvObject {
    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        let var_name = key.as_str()?;
        std::env::var(var_name).ok().map(Value::from)
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        // Don't enumerate env vars - too many and potentially sensitive
        Enumerator::Empty
    }
}
