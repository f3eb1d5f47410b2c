use crate::config::{Config, LLMProvider, RefinementPolicy, SelectorKind};
use crate::errors::ResearchError;
use crate::i18n::TargetLanguage;
use crate::types::parse_research_datetime;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;

/// deep-research-rs - 由Rust与AI驱动的自主深度调研引擎
#[derive(Parser, Debug)]
#[command(name = "deep-research-rs")]
#[command(
    about = "Autonomous deep-research agent: iteratively searches, reads, distills knowledge and writes a report for a research goal."
)]
#[command(version)]
pub struct Args {
    /// 调研目标
    pub goal: String,

    /// 参考时间（YYYY-MM-DD HH:MM:SS），晚于该时间发布的网页不会被采信，默认为当前时间
    #[arg(short = 't', long)]
    pub research_datetime: Option<String>,

    /// 最少步数
    #[arg(long)]
    pub min_steps: Option<usize>,

    /// 最多步数
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// 输出路径
    #[arg(short, long)]
    pub output_path: Option<PathBuf>,

    /// 配置文件路径
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// 是否启用详细日志
    #[arg(short, long)]
    pub verbose: bool,

    /// 动作选择策略 (llm, heuristic)
    #[arg(long)]
    pub selector: Option<String>,

    /// 知识精炼时机 (every_step, before_end, periodic:N)
    #[arg(long)]
    pub refinement_policy: Option<String>,

    /// 高能效模型，优先用于常规推理任务
    #[arg(long)]
    pub model_efficient: Option<String>,

    /// 高质量模型，用于复杂推理任务，以及作为efficient失效情况下的兜底
    #[arg(long)]
    pub model_powerful: Option<String>,

    /// LLM API基地址
    #[arg(long)]
    pub llm_api_base_url: Option<String>,

    /// LLM API KEY
    #[arg(long)]
    pub llm_api_key: Option<String>,

    /// LLM Provider (openai, moonshot, deepseek, openrouter, anthropic, ollama)
    #[arg(long)]
    pub llm_provider: Option<String>,

    /// 搜索接口的API KEY
    #[arg(long)]
    pub search_api_key: Option<String>,

    /// 批处理内部的最大并发数
    #[arg(long)]
    pub max_parallels: Option<usize>,

    /// 目标语言 (zh, en)
    #[arg(long)]
    pub target_language: Option<String>,

    /// 向量文件路径，指定后启用向量检索
    #[arg(long)]
    pub embeddings: Option<PathBuf>,

    /// 禁用代码执行
    #[arg(long)]
    pub no_code: bool,

    /// 不生成HTML报告
    #[arg(long)]
    pub no_html: bool,
}

/// 一次调研请求中不属于配置的部分
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    pub goal: String,
    pub research_datetime: DateTime<Utc>,
}

impl Args {
    /// 调研目标与参考时间
    pub fn research_request(&self) -> Result<ResearchRequest, ResearchError> {
        let goal = self.goal.trim().to_string();
        if goal.is_empty() {
            return Err(ResearchError::InvalidInput("调研目标不能为空".to_string()));
        }
        let research_datetime = match &self.research_datetime {
            Some(value) => parse_research_datetime(value)?,
            None => Utc::now(),
        };
        Ok(ResearchRequest {
            goal,
            research_datetime,
        })
    }

    /// 将CLI参数转换为配置
    pub fn into_config(self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;

        if let Some(output_path) = self.output_path {
            config.output_path = output_path;
        }
        if let Some(min_steps) = self.min_steps {
            config.research.min_steps = min_steps;
        }
        if let Some(max_steps) = self.max_steps {
            config.research.max_steps = max_steps;
        }
        if let Some(selector) = self.selector {
            config.research.selector = selector.parse::<SelectorKind>().map_err(|e| anyhow!(e))?;
        }
        if let Some(policy) = self.refinement_policy {
            config.research.refinement_policy =
                policy.parse::<RefinementPolicy>().map_err(|e| anyhow!(e))?;
        }
        if let Some(max_parallels) = self.max_parallels {
            config.research.max_parallels = max_parallels;
        }

        // 覆盖LLM配置
        if let Some(provider_str) = self.llm_provider {
            if let Ok(provider) = provider_str.parse::<LLMProvider>() {
                config.llm.provider = provider;
            } else {
                eprintln!(
                    "⚠️ 警告: 未知的provider: {}，使用默认provider",
                    provider_str
                );
            }
        }
        if let Some(llm_api_base_url) = self.llm_api_base_url {
            config.llm.api_base_url = llm_api_base_url;
        }
        if let Some(llm_api_key) = self.llm_api_key {
            config.llm.api_key = llm_api_key;
        }
        if let Some(model_efficient) = self.model_efficient {
            config.llm.model_efficient = model_efficient;
        }
        if let Some(model_powerful) = self.model_powerful {
            config.llm.model_powerful = model_powerful;
        }
        if let Some(search_api_key) = self.search_api_key {
            config.search.api_key = search_api_key;
        }

        // 目标语言配置
        if let Some(target_language_str) = self.target_language {
            if let Ok(target_language) = target_language_str.parse::<TargetLanguage>() {
                config.target_language = target_language;
            } else {
                eprintln!(
                    "⚠️ 警告: 未知的目标语言: {}，使用默认语言 ({})",
                    target_language_str,
                    config.target_language.display_name()
                );
            }
        }

        if let Some(embeddings) = self.embeddings {
            config.retrieval.enabled = true;
            config.retrieval.embeddings_path = Some(embeddings);
        }
        if self.no_code {
            config.code.enabled = false;
        }
        if self.no_html {
            config.render_html = false;
        }
        config.verbose = config.verbose || self.verbose;

        config.validate()?;
        Ok(config)
    }
}

// Include tests
#[cfg(test)]
mod tests;
