//! 工具框架 - 声明式参数校验、统一的执行结果以及带超时的执行器
//!
//! 工具只返回数据，所有对调研状态的合并都由控制器完成

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::errors::ToolError;
use crate::progress::ProgressSink;
use crate::types::{CodeResult, Page, RetrievalResult, SearchQuery};

pub mod batch_read;
pub mod batch_search;
pub mod code_execution;
pub mod retrieval;

pub use batch_read::BatchReadTool;
pub use batch_search::BatchSearchTool;
pub use code_execution::CodeExecutionTool;
pub use retrieval::RetrievalTool;

/// 工具参数
pub type ToolArgs = serde_json::Map<String, Value>;

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// 为一次批处理分配唯一编号
pub fn next_batch_id() -> u64 {
    NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed)
}

/// 参数类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Integer,
    Boolean,
    StringList,
    /// 页面对象数组
    PageList,
}

impl ParameterType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            ParameterType::String => value.is_string(),
            ParameterType::Integer => value.is_u64() || value.is_i64(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            ParameterType::PageList => value.as_array().is_some_and(|items| {
                items
                    .iter()
                    .all(|item| serde_json::from_value::<Page>(item.clone()).is_ok())
            }),
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            ParameterType::String => "string",
            ParameterType::Integer => "integer",
            ParameterType::Boolean => "boolean",
            ParameterType::StringList => "array of strings",
            ParameterType::PageList => "array of pages",
        }
    }

    fn json_schema(&self) -> Value {
        match self {
            ParameterType::String => json!({ "type": "string" }),
            ParameterType::Integer => json!({ "type": "integer" }),
            ParameterType::Boolean => json!({ "type": "boolean" }),
            ParameterType::StringList => json!({ "type": "array", "items": { "type": "string" } }),
            ParameterType::PageList => json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "title": { "type": "string" },
                        "url": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["title", "url"]
                }
            }),
        }
    }
}

/// 参数值的额外校验规则
pub type ParameterValidator = fn(&Value) -> Result<(), String>;

/// 工具参数声明
#[derive(Debug, Clone)]
pub struct ToolParameter {
    pub name: &'static str,
    pub description: &'static str,
    pub parameter_type: ParameterType,
    pub required: bool,
    pub validator: Option<ParameterValidator>,
}

impl ToolParameter {
    pub fn required(
        name: &'static str,
        description: &'static str,
        parameter_type: ParameterType,
    ) -> Self {
        Self {
            name,
            description,
            parameter_type,
            required: true,
            validator: None,
        }
    }

    pub fn optional(
        name: &'static str,
        description: &'static str,
        parameter_type: ParameterType,
    ) -> Self {
        Self {
            required: false,
            ..Self::required(name, description, parameter_type)
        }
    }

    pub fn with_validator(mut self, validator: ParameterValidator) -> Self {
        self.validator = Some(validator);
        self
    }
}

/// 工具执行产出的数据
#[derive(Debug, Clone, PartialEq)]
pub enum ToolPayload {
    BatchSearch {
        batch_id: u64,
        sub_goal: String,
        results: Vec<SearchQuery>,
    },
    BatchRead {
        batch_id: u64,
        /// 成功阅读且未被时间过滤排除的页面
        pages: Vec<Page>,
        /// 晚于参考时间而被排除的页面
        excluded: Vec<Page>,
        /// 抓取失败的页面
        failed: Vec<Page>,
    },
    Retrieval(RetrievalResult),
    Code(CodeResult),
}

/// 工具成功执行的产出
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub payload: ToolPayload,
    pub message: String,
}

impl ToolOutcome {
    pub fn new(payload: ToolPayload, message: impl Into<String>) -> Self {
        Self {
            payload,
            message: message.into(),
        }
    }
}

/// 所有工具都实现的接口
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具的唯一编码
    fn code(&self) -> &'static str;

    fn description(&self) -> &'static str;

    fn parameters(&self) -> Vec<ToolParameter>;

    /// 执行工具，参数已经通过校验
    async fn execute(&self, args: &ToolArgs, sink: &ProgressSink)
    -> Result<ToolOutcome, ToolError>;
}

/// 按照工具声明的参数校验调用参数
pub fn validate_args(tool: &dyn Tool, args: &ToolArgs) -> Result<(), ToolError> {
    let parameters = tool.parameters();

    if let Some(unknown) = args
        .keys()
        .find(|key| !parameters.iter().any(|p| p.name == key.as_str()))
    {
        return Err(ToolError::validation(tool.code(), unknown, "未声明的参数"));
    }

    for parameter in &parameters {
        match args.get(parameter.name) {
            None | Some(Value::Null) => {
                if parameter.required {
                    return Err(ToolError::validation(
                        tool.code(),
                        parameter.name,
                        "缺少必填参数",
                    ));
                }
            }
            Some(value) => {
                if !parameter.parameter_type.matches(value) {
                    return Err(ToolError::validation(
                        tool.code(),
                        parameter.name,
                        format!("期望类型为 {}", parameter.parameter_type.type_name()),
                    ));
                }
                if let Some(validator) = parameter.validator {
                    validator(value)
                        .map_err(|reason| ToolError::validation(tool.code(), parameter.name, reason))?;
                }
            }
        }
    }
    Ok(())
}

/// 工具的JSON Schema描述，供提示词使用
pub fn tool_definition(tool: &dyn Tool) -> Value {
    let parameters = tool.parameters();
    let properties: serde_json::Map<String, Value> = parameters
        .iter()
        .map(|p| {
            let mut schema = p.parameter_type.json_schema();
            if let Some(obj) = schema.as_object_mut() {
                obj.insert("description".to_string(), json!(p.description));
            }
            (p.name.to_string(), schema)
        })
        .collect();
    let required: Vec<&str> = parameters
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name)
        .collect();

    json!({
        "name": tool.code(),
        "description": tool.description(),
        "parameters": {
            "type": "object",
            "properties": properties,
            "required": required,
        }
    })
}

/// 统一的工具执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub tool_code: String,
    pub payload: Option<ToolPayload>,
    pub message: String,
    pub error: Option<String>,
    /// 失败是否源于参数校验（工具未被执行）
    pub validation_failed: bool,
}

impl ToolExecutionResult {
    fn succeeded(tool_code: &str, outcome: ToolOutcome) -> Self {
        Self {
            success: true,
            tool_code: tool_code.to_string(),
            payload: Some(outcome.payload),
            message: outcome.message,
            error: None,
            validation_failed: false,
        }
    }

    fn failed(tool_code: &str, error: &ToolError) -> Self {
        Self {
            success: false,
            tool_code: tool_code.to_string(),
            payload: None,
            message: format!("{} failed", tool_code),
            error: Some(error.to_string()),
            validation_failed: error.is_validation(),
        }
    }
}

/// 工具执行器
///
/// 所有错误（包括超时和panic）都在这里被转换为失败的执行结果
pub struct ToolExecutor {
    tools: BTreeMap<String, Arc<dyn Tool>>,
    timeout: Option<Duration>,
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ToolExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            tools: BTreeMap::new(),
            timeout,
        }
    }

    /// 注册工具，重复的编码会被拒绝
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let code = tool.code().to_string();
        if self.tools.contains_key(&code) {
            return Err(ToolError::AlreadyRegistered(code));
        }
        debug!(tool = %code, "注册工具");
        self.tools.insert(code, tool);
        Ok(())
    }

    pub fn get(&self, code: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(code).cloned()
    }

    pub fn has_tool(&self, code: &str) -> bool {
        self.tools.contains_key(code)
    }

    pub fn codes(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .values()
            .map(|tool| tool_definition(tool.as_ref()))
            .collect()
    }

    /// 执行工具，始终返回统一的执行结果
    pub async fn execute(
        &self,
        code: &str,
        args: &ToolArgs,
        sink: &ProgressSink,
    ) -> ToolExecutionResult {
        let Some(tool) = self.tools.get(code) else {
            let error = ToolError::NotFound(code.to_string());
            warn!(tool = %code, "{}", error);
            return ToolExecutionResult::failed(code, &error);
        };

        if let Err(error) = validate_args(tool.as_ref(), args) {
            warn!(tool = %code, "{}", error);
            return ToolExecutionResult::failed(code, &error);
        }

        info!(tool = %code, timeout_secs = ?self.timeout.map(|t| t.as_secs()), "🔧 执行工具");
        let guarded = AssertUnwindSafe(tool.execute(args, sink)).catch_unwind();

        let outcome = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
                Ok(result) => result,
                Err(_) => Ok(Err(ToolError::Timeout {
                    tool: code.to_string(),
                    timeout_secs: timeout.as_secs(),
                })),
            },
            None => guarded.await,
        };

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(ToolError::Execution {
                tool: code.to_string(),
                message: format!("panicked: {}", panic_message(panic.as_ref())),
            }),
        };

        match result {
            Ok(outcome) => {
                debug!(tool = %code, message = %outcome.message, "工具执行成功");
                ToolExecutionResult::succeeded(code, outcome)
            }
            Err(error) => {
                warn!(tool = %code, "{}", error);
                ToolExecutionResult::failed(code, &error)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// 读取字符串参数
pub(crate) fn arg_str<'a>(tool: &str, args: &'a ToolArgs, name: &str) -> Result<&'a str, ToolError> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::validation(tool, name, "缺少必填参数"))
}

/// 读取可选的正整数参数
pub(crate) fn arg_usize(args: &ToolArgs, name: &str) -> Option<usize> {
    args.get(name)
        .and_then(Value::as_u64)
        .map(|v| v as usize)
}

/// 读取字符串数组参数
pub(crate) fn arg_string_list(
    tool: &str,
    args: &ToolArgs,
    name: &str,
) -> Result<Vec<String>, ToolError> {
    args.get(name)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .ok_or_else(|| ToolError::validation(tool, name, "缺少必填参数"))
}

/// 要求字符串非空
pub(crate) fn non_empty_string(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err("不能为空".to_string()),
    }
}

/// 要求数组非空
pub(crate) fn non_empty_list(value: &Value) -> Result<(), String> {
    match value.as_array() {
        Some(items) if !items.is_empty() => Ok(()),
        _ => Err("至少需要一个元素".to_string()),
    }
}

/// 要求整数至少为1
pub(crate) fn positive_integer(value: &Value) -> Result<(), String> {
    match value.as_u64() {
        Some(n) if n >= 1 => Ok(()),
        _ => Err("必须是正整数".to_string()),
    }
}
