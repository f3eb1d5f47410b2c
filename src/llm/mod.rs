//! LLM文本生成接口

use std::marker::PhantomData;

use anyhow::Result;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::json::parse_llm_json;

pub mod client;

pub use client::LLMClient;

/// 调用时使用的模型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelHandle {
    /// 高能效模型，提示词过长时自动换用高质量模型
    Efficient,
    /// 高质量模型
    Powerful,
    /// 指定模型名称
    Named(String),
}

impl std::fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelHandle::Efficient => write!(f, "efficient"),
            ModelHandle::Powerful => write!(f, "powerful"),
            ModelHandle::Named(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// 一轮历史对话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// 文本生成服务
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// 基于提示词和此前的对话生成文本，调用失败时返回错误
    async fn generate_text(
        &self,
        model: &ModelHandle,
        prompt: &str,
        context: &[ChatTurn],
    ) -> Result<String>;

    /// 生成符合请求中JSON Schema的结构化结果
    ///
    /// 目标类型是结构体，结果总是JSON对象。默认实现把Schema附在提示词后走文本生成，
    /// 再从回答中解析JSON对象；支持结构化输出的服务应当覆盖它
    async fn generate_structured(
        &self,
        model: &ModelHandle,
        request: &dyn StructuredRequest,
        context: &[ChatTurn],
    ) -> Result<Value> {
        let prompt = format!(
            "{}\n\nRespond with a single JSON object that conforms to this JSON Schema, without any extra text:\n```json\n{}\n```",
            request.prompt(),
            request.schema()?
        );
        let answer = self.generate_text(model, &prompt, context).await?;
        let object: serde_json::Map<String, Value> = parse_llm_json(&answer)?;
        Ok(Value::Object(object))
    }
}

/// 擦除了目标类型的结构化输出请求
///
/// 目标类型只在请求内部可见，`TextGenerator` 因而可以作为trait object使用
#[async_trait]
pub trait StructuredRequest: Send + Sync {
    fn prompt(&self) -> &str;

    /// 目标类型的JSON Schema
    fn schema(&self) -> Result<String>;

    /// 通过rig的Extractor提取目标类型，结果以JSON值返回
    async fn extract_with(
        &self,
        client: &LLMClient,
        model: &ModelHandle,
        context: &[ChatTurn],
    ) -> Result<Value>;
}

struct TypedRequest<T> {
    prompt: String,
    target: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> StructuredRequest for TypedRequest<T>
where
    T: JsonSchema + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    fn prompt(&self) -> &str {
        &self.prompt
    }

    fn schema(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&schemars::schema_for!(T))?)
    }

    async fn extract_with(
        &self,
        client: &LLMClient,
        model: &ModelHandle,
        context: &[ChatTurn],
    ) -> Result<Value> {
        let extracted: T = client.extract(model, &self.prompt, context).await?;
        Ok(serde_json::to_value(extracted)?)
    }
}

/// 让模型输出 `T` 并解析，具体方式由 `TextGenerator::generate_structured` 决定
pub async fn generate_json<T>(
    llm: &dyn TextGenerator,
    model: &ModelHandle,
    prompt: &str,
    context: &[ChatTurn],
) -> Result<T>
where
    T: JsonSchema + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    let request = TypedRequest::<T> {
        prompt: prompt.to_string(),
        target: PhantomData,
    };
    let value = llm.generate_structured(model, &request, context).await?;
    Ok(serde_json::from_value(value)?)
}
