//! The code-API execution tool.
//!
//! Accepts a declarative program and runs it in the sandbox with a
//! wall-clock limit. In sandbox mode each invocation gets a fresh scratch
//! jail that is removed afterwards; direct mode uses the configured
//! workspace directory.

use async_trait::async_trait;
use meridian_protocol::{ToolError, ToolResult};
use serde_json::{json, Value};

use super::Tool;
use crate::config::ExecMode;
use crate::context::ServerContext;
use crate::sandbox::{self, FsJail, Program};

pub struct CodeRunTool;

#[async_trait]
impl Tool for CodeRunTool {
    fn name(&self) -> &'static str {
        "code_run"
    }

    fn description(&self) -> &'static str {
        "Execute a program of query, stream_aggregate, pipeline, skill and fs steps"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "program": {
                    "type": "object",
                    "description": "Steps referencing earlier results by id",
                    "properties": {
                        "steps": { "type": "array" },
                        "result": { "type": "string" }
                    },
                    "required": ["steps"]
                }
            },
            "required": ["program"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ServerContext) -> ToolResult<Value> {
        let program: Program = serde_json::from_value(
            args.get("program")
                .cloned()
                .ok_or_else(|| ToolError::invalid_argument("missing program"))?,
        )
        .map_err(|e| ToolError::invalid_argument(format!("bad program: {e}")))?;

        let (jail, scratch) = match ctx.config.exec_mode {
            ExecMode::Sandbox => {
                let jail = FsJail::create_scratch(&ctx.config.scratch_dir)?;
                (jail, true)
            }
            ExecMode::Direct => (FsJail::open(ctx.config.workspace_dir.clone())?, false),
        };

        let limit = ctx.config.sandbox.wall_clock;
        let result = match tokio::time::timeout(limit, sandbox::run_program(ctx, &program, &jail))
            .await
        {
            Ok(outcome) => outcome.map_err(sandbox::bound_error),
            Err(_) => Err(ToolError::deadline_exceeded(format!(
                "program exceeded wall-clock limit of {}s",
                limit.as_secs()
            ))),
        };

        if scratch {
            jail.cleanup();
        }

        let value = result?;
        Ok(json!({ "result": value }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema;

    #[test]
    fn test_program_required() {
        let tool = CodeRunTool;
        assert!(schema::validate(&tool.input_schema(), &json!({})).is_err());
        assert!(schema::validate(
            &tool.input_schema(),
            &json!({ "program": { "steps": [] } })
        )
        .is_ok());
    }
}
