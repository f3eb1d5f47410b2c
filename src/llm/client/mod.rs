//! LLM客户端 - 基于rig的文本生成服务

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use tracing::{info, warn};

use crate::config::LLMConfig;
use crate::llm::{ChatRole, ChatTurn, ModelHandle, StructuredRequest, TextGenerator};

mod providers;
pub mod utils;

use providers::ProviderClient;
use utils::evaluate_befitting_model;

const SYSTEM_PROMPT: &str = "You are a meticulous research assistant. You reason step by step, cite only what the provided material supports, and follow the requested output format exactly.";

/// LLM客户端 - 提供统一的LLM服务接口
#[derive(Clone)]
pub struct LLMClient {
    config: LLMConfig,
    client: ProviderClient,
}

impl LLMClient {
    /// 创建新的LLM客户端
    pub fn new(config: &LLMConfig) -> Result<Self> {
        let client = ProviderClient::new(config)?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// 检查模型连接和功能是否正常
    pub async fn check_connection(&self) -> Result<()> {
        println!("🔄 正在检查模型连接...");
        match self
            .generate_text(&ModelHandle::Efficient, "Hello", &[])
            .await
        {
            Ok(_) => {
                println!("✅ 模型连接正常");
                Ok(())
            }
            Err(e) => {
                eprintln!("❌ 模型连接失败: {}", e);
                Err(e)
            }
        }
    }

    /// 通用重试逻辑，用于处理异步操作的重试机制
    async fn retry_with_backoff<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        let max_retries = self.config.retry_attempts.max(1);
        let retry_delay_ms = self.config.retry_delay_ms;
        let mut retries = 0;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    retries += 1;
                    warn!(
                        attempt = retries,
                        max_retries, "❌ 调用模型服务出错，重试中: {}", err
                    );
                    if retries >= max_retries {
                        return Err(err);
                    }
                    // 线性退避
                    tokio::time::sleep(std::time::Duration::from_millis(
                        retry_delay_ms * retries as u64,
                    ))
                    .await;
                }
            }
        }
    }

    async fn chat_inner(
        &self,
        prompt: &str,
        context: &[ChatTurn],
        befitting_model: String,
        fallover_model: Option<String>,
    ) -> Result<String> {
        let agent = self
            .client
            .create_agent(&befitting_model, SYSTEM_PROMPT, &self.config);

        match self
            .retry_with_backoff(|| async { agent.chat(prompt, context).await })
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e) => match fallover_model {
                Some(model) => {
                    info!(
                        "❌ 模型 {} 尝试 {} 次均失败，尝试使用备选模型 {}: {}",
                        befitting_model, self.config.retry_attempts, model, e
                    );
                    let prompt_with_fixer = format!(
                        "{}\n\n**注意事项**此前我调用大模型过程时存在错误，错误信息为“{}”，你注意你这一次要规避这个错误",
                        prompt, e
                    );
                    Box::pin(self.chat_inner(&prompt_with_fixer, context, model, None)).await
                }
                None => Err(e),
            },
        }
    }

    /// 数据提取方法，通过rig的Extractor让模型直接提交 `T`
    pub async fn extract<T>(
        &self,
        model: &ModelHandle,
        prompt: &str,
        context: &[ChatTurn],
    ) -> Result<T>
    where
        T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
    {
        let user_prompt = with_history(prompt, context);
        let (befitting_model, fallover_model) =
            evaluate_befitting_model(&self.config, model, SYSTEM_PROMPT, &user_prompt);
        self.extract_inner(&user_prompt, befitting_model, fallover_model)
            .await
    }

    async fn extract_inner<T>(
        &self,
        user_prompt: &str,
        befitting_model: String,
        fallover_model: Option<String>,
    ) -> Result<T>
    where
        T: JsonSchema + for<'a> Deserialize<'a> + Serialize + Send + Sync + 'static,
    {
        let extractor =
            self.client
                .create_extractor::<T>(&befitting_model, SYSTEM_PROMPT, &self.config);

        match self
            .retry_with_backoff(|| async { extractor.extract(user_prompt).await })
            .await
        {
            Ok(extracted) => Ok(extracted),
            Err(e) => match fallover_model {
                Some(model) => {
                    info!(
                        "❌ 模型 {} 提取结构化结果失败，尝试使用备选模型 {}: {}",
                        befitting_model, model, e
                    );
                    let prompt_with_fixer = format!(
                        "{}\n\n**注意事项**此前我调用大模型过程时存在错误，错误信息为“{}”，你注意你这一次要规避这个错误",
                        user_prompt, e
                    );
                    Box::pin(self.extract_inner(&prompt_with_fixer, model, None)).await
                }
                None => Err(e),
            },
        }
    }
}

/// Extractor只接受单条输入，历史对话以文本形式放在提示词之前
fn with_history(prompt: &str, context: &[ChatTurn]) -> String {
    if context.is_empty() {
        return prompt.to_string();
    }
    let mut text = String::from("# Previous conversation\n");
    for turn in context {
        let role = match turn.role {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        };
        text.push_str(&format!("{}: {}\n", role, turn.content));
    }
    text.push('\n');
    text.push_str(prompt);
    text
}

#[async_trait]
impl TextGenerator for LLMClient {
    async fn generate_text(
        &self,
        model: &ModelHandle,
        prompt: &str,
        context: &[ChatTurn],
    ) -> Result<String> {
        let (befitting_model, fallover_model) =
            evaluate_befitting_model(&self.config, model, SYSTEM_PROMPT, prompt);
        self.chat_inner(prompt, context, befitting_model, fallover_model)
            .await
    }

    async fn generate_structured(
        &self,
        model: &ModelHandle,
        request: &dyn StructuredRequest,
        context: &[ChatTurn],
    ) -> Result<Value> {
        request.extract_with(self, model, context).await
    }
}
