//! Run requests accepted by the engine.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Engine options shared by every run request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Opts {
    pub cache_dir: Option<String>,
    pub disable_cache: bool,
    pub quiet: Option<bool>,
    pub chdir: Option<String>,
    pub sub_tool: Option<String>,
    pub workspace: Option<String>,
    pub credential_override: Option<String>,
    pub confirm: bool,
}

impl Opts {
    /// Command-line flags understood by the `gptscript` binary.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(dir) = &self.cache_dir {
            args.push(format!("--cache-dir={dir}"));
        }
        if self.disable_cache {
            args.push("--disable-cache".to_string());
        }
        if let Some(quiet) = self.quiet {
            args.push(format!("--quiet={quiet}"));
        }
        if let Some(dir) = &self.chdir {
            args.push(format!("--chdir={dir}"));
        }
        if let Some(tool) = &self.sub_tool {
            args.push(format!("--sub-tool={tool}"));
        }
        if let Some(workspace) = &self.workspace {
            args.push(format!("--workspace={workspace}"));
        }
        if let Some(cred) = &self.credential_override {
            args.push(format!("--credential-override={cred}"));
        }
        if self.confirm {
            args.push("--confirm".to_string());
        }
        args
    }
}

/// A tool described field by field instead of as free-form text.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimpleTool {
    pub name: String,
    pub description: String,
    pub tools: Vec<String>,
    pub max_tokens: Option<u32>,
    pub model_name: Option<String>,
    pub cache: Option<bool>,
    pub temperature: Option<f32>,
    pub json_response: bool,
    pub internal_prompt: Option<bool>,
    pub chat: bool,
    pub args: BTreeMap<String, String>,
    pub instructions: String,
}

impl fmt::Display for SimpleTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            writeln!(f, "Name: {}", self.name)?;
        }
        if !self.description.is_empty() {
            writeln!(f, "Description: {}", self.description)?;
        }
        if !self.tools.is_empty() {
            writeln!(f, "Tools: {}", self.tools.join(", "))?;
        }
        if let Some(max) = self.max_tokens {
            writeln!(f, "Max Tokens: {max}")?;
        }
        if let Some(model) = &self.model_name {
            writeln!(f, "Model: {model}")?;
        }
        if let Some(cache) = self.cache {
            writeln!(f, "Cache: {cache}")?;
        }
        if let Some(temperature) = self.temperature {
            writeln!(f, "Temperature: {temperature}")?;
        }
        if self.json_response {
            writeln!(f, "JSON Response: true")?;
        }
        if let Some(internal) = self.internal_prompt {
            writeln!(f, "Internal Prompt: {internal}")?;
        }
        if self.chat {
            writeln!(f, "Chat: true")?;
        }
        for (arg, description) in &self.args {
            writeln!(f, "Args: {arg}: {description}")?;
        }
        write!(f, "\n{}", self.instructions)
    }
}

/// The tool to execute: raw script text, or a structured definition.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolDef {
    FreeForm(String),
    Simple(SimpleTool),
}

impl fmt::Display for ToolDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FreeForm(content) => f.write_str(content),
            Self::Simple(tool) => fmt::Display::fmt(tool, f),
        }
    }
}

/// What a run executes.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    /// Tool text piped to the engine on stdin.
    Tool(ToolDef),
    /// Script file on the engine's filesystem.
    File(String),
}

/// A single execution request.
#[derive(Debug, Clone, PartialEq)]
pub struct Run {
    pub opts: Opts,
    pub target: Target,
    pub input: String,
}

impl Run {
    /// Positional arguments after the option flags.
    pub fn target_args(&self) -> Vec<String> {
        let program = match &self.target {
            Target::Tool(_) => "-".to_string(),
            Target::File(path) => path.clone(),
        };
        let mut args = vec![program];
        if !self.input.is_empty() {
            args.push(self.input.clone());
        }
        args
    }

    /// Text to write on the engine's stdin, if any.
    pub fn stdin(&self) -> Option<String> {
        match &self.target {
            Target::Tool(tool) => Some(tool.to_string()),
            Target::File(_) => None,
        }
    }
}
