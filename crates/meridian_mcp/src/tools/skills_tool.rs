//! Skills catalog and invocation.

use async_trait::async_trait;
use meridian_protocol::ToolResult;
use serde::Deserialize;
use serde_json::{json, Value};

use super::Tool;
use crate::context::ServerContext;
use crate::skills;

pub struct SkillCatalogTool;

#[async_trait]
impl Tool for SkillCatalogTool {
    fn name(&self) -> &'static str {
        "skill_catalog"
    }

    fn description(&self) -> &'static str {
        "List the deterministic skills available to tools and programs"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, _ctx: &ServerContext) -> ToolResult<Value> {
        Ok(json!({ "skills": skills::catalog() }))
    }
}

pub struct SkillRunTool;

#[derive(Debug, Deserialize)]
struct SkillRunArgs {
    name: String,
    input: Value,
}

#[async_trait]
impl Tool for SkillRunTool {
    fn name(&self) -> &'static str {
        "skill_run"
    }

    fn description(&self) -> &'static str {
        "Run a named skill over row data"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string" },
                "input": { "description": "Rows, or {rows, ...} with skill options" }
            },
            "required": ["name", "input"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ServerContext) -> ToolResult<Value> {
        let parsed: SkillRunArgs = serde_json::from_value(args)?;
        skills::run(&parsed.name, &parsed.input)
    }
}
