use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::config::CodeConfig;
use crate::errors::ToolError;
use crate::progress::ProgressSink;
use crate::tools::{
    ParameterType, Tool, ToolArgs, ToolOutcome, ToolParameter, ToolPayload, arg_str,
    non_empty_string,
};
use crate::types::{CodeResult, EventKind};

pub const CODE_EXECUTION: &str = "code_execution";

/// 在独立的解释器进程中执行代码
///
/// 代码内部的异常记录在结果里，只有解释器无法启动才视为工具失败
pub struct CodeExecutionTool {
    interpreter: String,
    interpreter_args: Vec<String>,
    working_dir: PathBuf,
}

impl CodeExecutionTool {
    pub fn new(
        interpreter: impl Into<String>,
        interpreter_args: Vec<String>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args,
            working_dir,
        }
    }

    pub fn from_config(config: &CodeConfig) -> Self {
        Self::new(
            config.interpreter.clone(),
            config.interpreter_args.clone(),
            config.working_dir.clone(),
        )
    }
}

/// 标准输出的最后一个非空行若为JSON，则作为结构化输出
fn structured_output(stdout: &str) -> Value {
    stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .and_then(|line| serde_json::from_str(line.trim()).ok())
        .unwrap_or(Value::Null)
}

#[async_trait]
impl Tool for CodeExecutionTool {
    fn code(&self) -> &'static str {
        CODE_EXECUTION
    }

    fn description(&self) -> &'static str {
        "Execute code in an isolated interpreter. Print the final result as one JSON line to expose it as structured output."
    }

    fn parameters(&self) -> Vec<ToolParameter> {
        vec![
            ToolParameter::required("code", "Code to execute", ParameterType::String)
                .with_validator(non_empty_string),
        ]
    }

    async fn execute(
        &self,
        args: &ToolArgs,
        sink: &ProgressSink,
    ) -> Result<ToolOutcome, ToolError> {
        let code_str = arg_str(CODE_EXECUTION, args, "code")?.to_string();
        debug!(interpreter = %self.interpreter, code_len = code_str.len(), "运行代码");

        let output = Command::new(&self.interpreter)
            .args(&self.interpreter_args)
            .arg(&code_str)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ToolError::Execution {
                tool: CODE_EXECUTION.to_string(),
                message: format!("无法启动解释器 {}: {}", self.interpreter, e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exception = if output.status.success() {
            None
        } else if stderr.is_empty() {
            Some(format!("process exited with {}", output.status))
        } else {
            Some(stderr)
        };

        let code_result = CodeResult {
            code_str,
            output: structured_output(&stdout),
            stdout,
            exception,
            exit_code: output.status.code(),
        };

        sink.emit(EventKind::CodeExecution {
            code_result: code_result.clone(),
        });
        let message = if code_result.succeeded() {
            "Code executed successfully"
        } else {
            "Code raised an exception"
        };
        Ok(ToolOutcome::new(ToolPayload::Code(code_result), message))
    }
}
