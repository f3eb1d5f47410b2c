use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::i18n::TargetLanguage;

/// 默认配置文件名，位于当前工作目录
pub const DEFAULT_CONFIG_FILE: &str = "deep-research.toml";

/// LLM Provider类型
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
pub enum LLMProvider {
    #[serde(rename = "openai")]
    #[default]
    OpenAI,
    #[serde(rename = "moonshot")]
    Moonshot,
    #[serde(rename = "deepseek")]
    DeepSeek,
    #[serde(rename = "openrouter")]
    OpenRouter,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "ollama")]
    Ollama,
}

impl std::fmt::Display for LLMProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LLMProvider::OpenAI => write!(f, "openai"),
            LLMProvider::Moonshot => write!(f, "moonshot"),
            LLMProvider::DeepSeek => write!(f, "deepseek"),
            LLMProvider::OpenRouter => write!(f, "openrouter"),
            LLMProvider::Anthropic => write!(f, "anthropic"),
            LLMProvider::Ollama => write!(f, "ollama"),
        }
    }
}

impl std::str::FromStr for LLMProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(LLMProvider::OpenAI),
            "moonshot" => Ok(LLMProvider::Moonshot),
            "deepseek" => Ok(LLMProvider::DeepSeek),
            "openrouter" => Ok(LLMProvider::OpenRouter),
            "anthropic" => Ok(LLMProvider::Anthropic),
            "ollama" => Ok(LLMProvider::Ollama),
            _ => Err(format!("Unknown provider: {}", s)),
        }
    }
}

/// 知识精炼的时机
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RefinementPolicy {
    /// 每个成功的步骤之后
    EveryStep,
    /// 每隔若干个成功的步骤
    Periodic { every: usize },
    /// 只在结束前
    #[default]
    BeforeEnd,
}

impl RefinementPolicy {
    /// 完成第 `step` 步之后是否需要精炼，结束前的精炼不受此影响
    pub fn should_refine_after(&self, step: usize) -> bool {
        match self {
            RefinementPolicy::EveryStep => true,
            RefinementPolicy::Periodic { every } => *every > 0 && step % every == 0,
            RefinementPolicy::BeforeEnd => false,
        }
    }
}

impl std::str::FromStr for RefinementPolicy {
    type Err = String;

    /// 支持 `every_step`、`before_end` 以及 `periodic:N`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        match normalized.as_str() {
            "every_step" => Ok(RefinementPolicy::EveryStep),
            "before_end" => Ok(RefinementPolicy::BeforeEnd),
            other => match other.strip_prefix("periodic:") {
                Some(every) => every
                    .trim()
                    .parse::<usize>()
                    .map(|every| RefinementPolicy::Periodic { every })
                    .map_err(|_| format!("Invalid refinement interval: {}", every)),
                None => Err(format!("Unknown refinement policy: {}", s)),
            },
        }
    }
}

/// 选择下一步动作的策略
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    /// 由大模型推理决定
    #[default]
    Llm,
    /// 固定的启发式规则
    Heuristic,
}

impl std::str::FromStr for SelectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "llm" => Ok(SelectorKind::Llm),
            "heuristic" => Ok(SelectorKind::Heuristic),
            _ => Err(format!("Unknown selector: {}", s)),
        }
    }
}

/// 应用程序配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Config {
    /// 目标语言
    pub target_language: TargetLanguage,

    /// 报告输出路径
    pub output_path: PathBuf,

    /// 是否额外生成HTML报告
    pub render_html: bool,

    /// 是否启用详细日志
    pub verbose: bool,

    /// 调研流程配置
    pub research: ResearchConfig,

    /// LLM模型配置
    pub llm: LLMConfig,

    /// 搜索配置
    pub search: SearchConfig,

    /// 网页阅读配置
    pub reader: ReaderConfig,

    /// 向量检索配置
    pub retrieval: RetrievalConfig,

    /// 代码执行配置
    pub code: CodeConfig,
}

/// 调研流程配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ResearchConfig {
    /// 最少步数
    pub min_steps: usize,

    /// 最多步数
    pub max_steps: usize,

    /// 知识精炼时机
    pub refinement_policy: RefinementPolicy,

    /// 每隔多少步发出一次状态快照，0表示只在结束时发出
    pub snapshot_interval: usize,

    /// 判定两个知识点主题重叠的相似度阈值
    pub similarity_threshold: f64,

    /// 每次批量阅读最多阅读的页面数
    pub max_pages_per_read: usize,

    /// 批处理内部的最大并发数
    pub max_parallels: usize,

    /// 单次工具调用的超时时间（秒），不设置则不限时
    pub tool_timeout_seconds: Option<u64>,

    /// 动作选择策略
    pub selector: SelectorKind,
}

/// LLM模型配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LLMConfig {
    /// LLM Provider类型
    pub provider: LLMProvider,

    /// LLM API KEY
    pub api_key: String,

    /// LLM API基地址
    pub api_base_url: String,

    /// 高能效模型，优先用于常规推理任务
    pub model_efficient: String,

    /// 高质量模型，用于长上下文和报告撰写，以及作为efficient失效情况下的兜底
    pub model_powerful: String,

    /// 最大tokens
    pub max_tokens: u32,

    /// 温度
    pub temperature: f64,

    /// 重试次数
    pub retry_attempts: u32,

    /// 重试间隔（毫秒）
    pub retry_delay_ms: u64,
}

/// 搜索配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    /// SerpAPI兼容的搜索接口地址
    pub endpoint: String,

    pub api_key: String,

    /// 搜索引擎
    pub engine: String,

    /// 每个查询最多保留的结果数
    pub max_results: usize,

    /// 请求超时时间（秒）
    pub timeout_seconds: u64,
}

/// 网页阅读配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ReaderConfig {
    pub user_agent: String,

    /// 页面正文最多保留的字符数
    pub max_content_chars: usize,

    /// 提炼知识时每个页面最多使用的token数
    pub max_tokens_per_page: usize,

    /// 请求超时时间（秒）
    pub timeout_seconds: u64,
}

/// 向量检索配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub enabled: bool,

    /// 向量文件路径（JSON数组，元素为 {id, text, embedding}）
    pub embeddings_path: Option<PathBuf>,

    /// 默认的集合名称
    pub collection_name: String,

    /// 默认返回的结果数
    pub n_results: usize,

    /// 向量接口地址
    pub embedding_base_url: String,

    pub embedding_model: String,

    /// 为空时使用LLM的API KEY
    pub embedding_api_key: String,
}

/// 代码执行配置
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CodeConfig {
    pub enabled: bool,

    /// 解释器命令
    pub interpreter: String,

    /// 解释器参数，代码作为最后一个参数传入
    pub interpreter_args: Vec<String>,

    /// 代码的工作目录
    pub working_dir: PathBuf,

    /// 编写代码前是否先检索相关的接口文档
    pub retrieve_docs: bool,
}

impl Config {
    /// 从文件加载配置
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let mut file =
            File::open(path).context(format!("Failed to open config file: {:?}", path))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// 加载配置：指定了路径则必须存在，否则尝试当前目录下的默认配置文件，都没有则使用默认值
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(&path.to_path_buf()),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// 检查配置是否自洽
    pub fn validate(&self) -> Result<()> {
        if self.research.min_steps > self.research.max_steps {
            bail!(
                "最少步数({})不能大于最多步数({})",
                self.research.min_steps,
                self.research.max_steps
            );
        }
        if !(0.0..=1.0).contains(&self.research.similarity_threshold) {
            bail!(
                "相似度阈值必须在0到1之间，当前为{}",
                self.research.similarity_threshold
            );
        }
        if let RefinementPolicy::Periodic { every: 0 } = self.research.refinement_policy {
            bail!("周期性精炼的间隔必须大于0");
        }
        if self.retrieval.enabled && self.retrieval.embeddings_path.is_none() {
            bail!("启用向量检索时必须配置 retrieval.embeddings_path");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target_language: TargetLanguage::default(),
            output_path: PathBuf::from("./research.out"),
            render_html: true,
            verbose: false,
            research: ResearchConfig::default(),
            llm: LLMConfig::default(),
            search: SearchConfig::default(),
            reader: ReaderConfig::default(),
            retrieval: RetrievalConfig::default(),
            code: CodeConfig::default(),
        }
    }
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            min_steps: 3,
            max_steps: 10,
            refinement_policy: RefinementPolicy::default(),
            snapshot_interval: 1,
            similarity_threshold: 0.5,
            max_pages_per_read: 5,
            max_parallels: 3,
            tool_timeout_seconds: Some(300),
            selector: SelectorKind::default(),
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            provider: LLMProvider::default(),
            api_key: std::env::var("DEEP_RESEARCH_LLM_API_KEY").unwrap_or_default(),
            api_base_url: String::from("https://api-inference.modelscope.cn/v1"),
            model_efficient: String::from("Qwen/Qwen3-Next-80B-A3B-Instruct"),
            model_powerful: String::from("Qwen/Qwen3-235B-A22B-Instruct-2507"),
            max_tokens: 32768,
            temperature: 0.1,
            retry_attempts: 3,
            retry_delay_ms: 3000,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: String::from("https://serpapi.com/search.json"),
            api_key: std::env::var("SERPAPI_API_KEY").unwrap_or_default(),
            engine: String::from("google"),
            max_results: 8,
            timeout_seconds: 30,
        }
    }
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            user_agent: String::from("Mozilla/5.0 (compatible; deep-research-rs/0.1)"),
            max_content_chars: 40_000,
            max_tokens_per_page: 6_000,
            timeout_seconds: 30,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            embeddings_path: None,
            collection_name: String::from("default"),
            n_results: 3,
            embedding_base_url: String::from("https://api.openai.com/v1"),
            embedding_model: String::from("text-embedding-3-small"),
            embedding_api_key: std::env::var("DEEP_RESEARCH_EMBEDDING_API_KEY")
                .unwrap_or_default(),
        }
    }
}

impl Default for CodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: String::from("python3"),
            interpreter_args: vec![String::from("-c")],
            working_dir: std::env::temp_dir(),
            retrieve_docs: true,
        }
    }
}
