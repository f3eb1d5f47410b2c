use thiserror::Error;

/// 工具调用错误
///
/// 所有错误都会在ToolExecutor边界被转换为失败的执行结果，不会越过执行器向上抛出
#[derive(Debug, Error)]
pub enum ToolError {
    /// 参数校验失败，工具不会被实际执行
    #[error("工具 {tool} 的参数 `{parameter}` 校验失败: {reason}")]
    Validation {
        tool: String,
        parameter: String,
        reason: String,
    },

    #[error("工具 {tool} 执行失败: {message}")]
    Execution { tool: String, message: String },

    /// 向量检索后端不可用
    #[error("向量检索失败: {0}")]
    Retrieval(String),

    #[error("工具 {tool} 执行超时（{timeout_secs}秒）")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("未注册的工具: {0}")]
    NotFound(String),

    #[error("工具 {0} 已经注册过")]
    AlreadyRegistered(String),
}

impl ToolError {
    pub fn validation(tool: &str, parameter: &str, reason: impl Into<String>) -> Self {
        ToolError::Validation {
            tool: tool.to_string(),
            parameter: parameter.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ToolError::Validation { .. })
    }
}

/// 调研流程错误，只有这一类错误会逃逸出一次调研运行
#[derive(Debug, Error)]
pub enum ResearchError {
    /// 调研参数非法（步数预算、参考时间格式等），运行不会开始
    #[error("调研参数非法: {0}")]
    InvalidInput(String),

    /// 控制器无法继续：同一步骤连续失败两次，或最终报告生成失败
    #[error("调研在第 {step} 步终止: {message}")]
    Fatal { step: usize, message: String },
}
