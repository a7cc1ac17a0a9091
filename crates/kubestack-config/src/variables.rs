//! Variable interpolation for stack files.
//!
//! Supports variables like:
//! - `${env.account}` - Account of the deployment environment
//! - `${env.region}` - Region of the deployment environment
//! - `${stack.name}` - Name of the stack being parsed
//! - `${var.NAME}` - Variable declared with a top-level `variable` node
//! - `${os.NAME}` - Process environment variable
//!
//! Unknown variables are left in place so a typo shows up verbatim in the
//! rendered config instead of silently becoming an empty string.

use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::LazyLock;

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_-]*)?)\}")
        .expect("variable pattern is valid")
});

/// Variables available while a stack file is parsed.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    /// Account and region, once the `environment` node has been read
    pub account: Option<String>,
    pub region: Option<String>,
    /// Stack currently being parsed
    pub stack: Option<String>,
    /// `variable` nodes
    pub vars: HashMap<String, String>,
    /// Process environment
    pub os: HashMap<String, String>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate `os.*` from the current process environment.
    pub fn populate_os(&mut self) {
        for (key, value) in std::env::vars() {
            self.os.insert(key, value);
        }
    }

    /// Declare a stack-file variable.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.vars.insert(name.to_string(), value.into());
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["env", "account"] => self.account.clone(),
            ["env", "region"] => self.region.clone(),
            ["stack", "name"] => self.stack.clone(),
            ["var", name] => self.vars.get(*name).cloned(),
            ["os", name] => self.os.get(*name).cloned(),
            _ => None,
        }
    }

    /// Interpolate all variables in a string.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate every string inside a JSON document, keys excluded.
    pub fn interpolate_json(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.interpolate(&s)),
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|v| self.interpolate_json(v)).collect())
            }
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.interpolate_json(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    /// Names of the variables used in `input` that do not resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

/// Builder for creating VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_environment(mut self, account: impl Into<String>, region: impl Into<String>) -> Self {
        self.ctx.account = Some(account.into());
        self.ctx.region = Some(region.into());
        self
    }

    pub fn with_stack(mut self, name: impl Into<String>) -> Self {
        self.ctx.stack = Some(name.into());
        self
    }

    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.vars.insert(key.into(), value.into());
        self
    }

    pub fn with_os(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.os.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_environment_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_environment("532673134317", "eu-west-1")
            .build();

        let result = ctx.interpolate("${env.account}.dkr.ecr.${env.region}.amazonaws.com");
        assert_eq!(result, "532673134317.dkr.ecr.eu-west-1.amazonaws.com");
    }

    #[test]
    fn test_stack_and_custom_variables() {
        let ctx = VariableContextBuilder::new()
            .with_stack("FastApiEksCluster")
            .with_var("domain", "piercuta.com")
            .build();

        let result = ctx.interpolate("${stack.name} serves my-fastapi.${var.domain}");
        assert_eq!(result, "FastApiEksCluster serves my-fastapi.piercuta.com");
    }

    #[test]
    fn test_os_variables() {
        let ctx = VariableContextBuilder::new().with_os("OWNER", "platform").build();
        assert_eq!(ctx.interpolate("owner=${os.OWNER}"), "owner=platform");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        let result = ctx.interpolate("Unknown: ${var.missing} ${env.account}");
        assert_eq!(result, "Unknown: ${var.missing} ${env.account}");
        assert_eq!(ctx.unresolved("${var.missing} ${env.account}").len(), 2);
    }

    #[test]
    fn test_interpolate_json_leaves_keys_and_numbers() {
        let ctx = VariableContextBuilder::new()
            .with_environment("532673134317", "eu-west-1")
            .build();
        let doc = json!({
            "${env.region}": "${env.region}",
            "replicas": 2,
            "args": ["--region=${env.region}"]
        });
        let out = ctx.interpolate_json(doc);
        assert_eq!(
            out,
            json!({
                "${env.region}": "eu-west-1",
                "replicas": 2,
                "args": ["--region=eu-west-1"]
            })
        );
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new().with_var("sha", "abc123").build();

        let result = ctx.interpolate(r#"{"sha": "${var.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
