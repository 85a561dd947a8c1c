//! Registry of built-in tools.
//!
//! Built once at startup and shared by reference. Tool names carrying the
//! `sys_` prefix are built-ins run by the tool-step worker; every other name
//! is a client function answered through submit_tool_outputs.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Value, json};

use crate::error::ToolError;
use crate::llm::provider::{FunctionDefinition, ToolDefinition};
use crate::runs::model::AssistantTool;

/// Name prefix reserved for built-in tools.
pub const BUILTIN_PREFIX: &str = "sys_";

/// Which worker answers a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Builtin,
    Function,
}

impl ToolKind {
    pub fn of(name: &str) -> Self {
        if name.starts_with(BUILTIN_PREFIX) {
            Self::Builtin
        } else {
            Self::Function
        }
    }
}

/// Where a built-in's program comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgramSource {
    /// Always the same program; the call arguments are fed on stdin.
    Fixed(String),
    /// Taken from a string argument of the call.
    Argument(String),
}

#[derive(Debug, Clone)]
pub struct BuiltinTool {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub program: ProgramSource,
    pub env: BTreeMap<String, String>,
    /// Ask the user before every execution.
    pub requires_confirmation: bool,
}

/// A built-in call resolved to something an executor can run.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedCall {
    pub program: String,
    pub input: String,
}

impl BuiltinTool {
    pub fn definition(&self) -> FunctionDefinition {
        FunctionDefinition {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            parameters: Some(self.parameters.clone()),
        }
    }

    /// Resolve the program and stdin input for a call's JSON arguments.
    pub fn prepare(&self, arguments: &str) -> Result<PreparedCall, ToolError> {
        match &self.program {
            ProgramSource::Fixed(program) => Ok(PreparedCall {
                program: program.clone(),
                input: arguments.to_string(),
            }),
            ProgramSource::Argument(key) => {
                let args: Value = if arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(arguments).map_err(|e| ToolError::InvalidParameters {
                        name: self.name.clone(),
                        reason: e.to_string(),
                    })?
                };
                let program = args
                    .get(key)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| ToolError::InvalidParameters {
                        name: self.name.clone(),
                        reason: format!("missing '{key}' parameter"),
                    })?;
                let input = args
                    .get("input")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                Ok(PreparedCall {
                    program: program.to_string(),
                    input: input.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, BuiltinTool>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the stock built-ins.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for tool in [shell_tool(), current_time_tool()] {
            // Stock names carry the prefix.
            let _ = registry.register(tool);
        }
        registry
    }

    /// Register a built-in. Names must carry [`BUILTIN_PREFIX`].
    pub fn register(&mut self, tool: BuiltinTool) -> Result<(), ToolError> {
        if ToolKind::of(&tool.name) != ToolKind::Builtin {
            return Err(ToolError::InvalidParameters {
                name: tool.name.clone(),
                reason: format!("built-in tool names must start with '{BUILTIN_PREFIX}'"),
            });
        }
        tracing::debug!("Registered tool: {}", tool.name);
        self.tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&BuiltinTool> {
        self.tools.get(name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Tool definitions to send to the model for an assistant's tool list.
    /// Unknown built-in names are skipped.
    pub fn definitions_for(&self, tools: &[AssistantTool]) -> Vec<ToolDefinition> {
        tools
            .iter()
            .filter_map(|tool| match tool {
                AssistantTool::Function { function } => {
                    Some(ToolDefinition::function(function.clone()))
                }
                AssistantTool::Builtin { name } => match self.get(name) {
                    Some(builtin) => Some(ToolDefinition::function(builtin.definition())),
                    None => {
                        tracing::warn!(tool = %name, "Assistant references unknown built-in tool");
                        None
                    }
                },
            })
            .collect()
    }
}

fn shell_tool() -> BuiltinTool {
    BuiltinTool {
        name: "sys_shell".to_string(),
        description: "Execute a shell command. Optional 'input' is written to stdin. \
                      Returns stdout and stderr."
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "input": {
                    "type": "string",
                    "description": "Text written to the command's stdin"
                }
            },
            "required": ["command"]
        }),
        program: ProgramSource::Argument("command".to_string()),
        env: BTreeMap::new(),
        requires_confirmation: true,
    }
}

fn current_time_tool() -> BuiltinTool {
    BuiltinTool {
        name: "sys_current_time".to_string(),
        description: "Get the current UTC date and time.".to_string(),
        parameters: json!({ "type": "object", "properties": {} }),
        program: ProgramSource::Fixed("date -u +%Y-%m-%dT%H:%M:%SZ".to_string()),
        env: BTreeMap::new(),
        requires_confirmation: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_decides_kind() {
        assert_eq!(ToolKind::of("sys_shell"), ToolKind::Builtin);
        assert_eq!(ToolKind::of("get_weather"), ToolKind::Function);
        assert_eq!(ToolKind::of("system"), ToolKind::Function);
    }

    #[test]
    fn defaults_are_registered() {
        let registry = ToolRegistry::with_defaults();
        assert_eq!(registry.list(), vec!["sys_current_time", "sys_shell"]);
        assert!(registry.get("sys_shell").unwrap().requires_confirmation);
    }

    #[test]
    fn unprefixed_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        let mut tool = shell_tool();
        tool.name = "shell".to_string();
        assert!(registry.register(tool).is_err());
        assert!(registry.list().is_empty());
    }

    #[test]
    fn argument_program_reads_command() {
        let tool = shell_tool();
        let call = tool
            .prepare(r#"{"command":"wc -c","input":"abc"}"#)
            .unwrap();
        assert_eq!(call.program, "wc -c");
        assert_eq!(call.input, "abc");

        assert!(matches!(
            tool.prepare(r#"{"input":"abc"}"#),
            Err(ToolError::InvalidParameters { .. })
        ));
        assert!(tool.prepare("not json").is_err());
    }

    #[test]
    fn fixed_program_passes_arguments_on_stdin() {
        let call = current_time_tool().prepare("{}").unwrap();
        assert!(call.program.starts_with("date"));
        assert_eq!(call.input, "{}");
    }

    #[test]
    fn definitions_cover_functions_and_known_builtins() {
        let registry = ToolRegistry::with_defaults();
        let tools = vec![
            AssistantTool::Function {
                function: FunctionDefinition {
                    name: "get_weather".into(),
                    description: None,
                    parameters: Some(json!({"type": "object"})),
                },
            },
            AssistantTool::Builtin {
                name: "sys_shell".into(),
            },
            AssistantTool::Builtin {
                name: "sys_missing".into(),
            },
        ];
        let defs = registry.definitions_for(&tools);
        let names: Vec<&str> = defs.iter().map(|d| d.function.name.as_str()).collect();
        assert_eq!(names, vec!["get_weather", "sys_shell"]);
    }
}
