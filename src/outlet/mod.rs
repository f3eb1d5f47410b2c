//! 报告输出 - HTML渲染与落盘

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::i18n::TargetLanguage;
use crate::llm::{ModelHandle, TextGenerator};
use crate::research::FinalReport;

const HTML_PROMPT_ZH: &str = "请把下面的调研报告转换为一个完整、独立的HTML页面：\
保留全部内容和引用来源，使用内联CSS排版，标题层级清晰，表格和列表易于阅读。\
只输出HTML代码，不要输出任何解释。\n\n";

const HTML_PROMPT_EN: &str = "Convert the research report below into one complete, standalone HTML page. \
Keep all content and cited sources, use inline CSS, clear heading levels and readable tables and lists. \
Output only the HTML code without any explanation.\n\n";

/// 去掉模型回答外层的代码块标记
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // 跳过 ```html 这一行
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    body.trim_end()
        .strip_suffix("```")
        .unwrap_or(body)
        .trim()
        .to_string()
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// 不借助模型的Markdown到HTML转换
pub fn markdown_to_html(title: &str, report: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        escape_html(title),
        markdown::to_html(report)
    )
}

/// 报告渲染器，未配置模型或模型调用失败时使用Markdown转换
pub struct HtmlRenderer {
    llm: Option<Arc<dyn TextGenerator>>,
    language: TargetLanguage,
}

impl HtmlRenderer {
    pub fn new(llm: Option<Arc<dyn TextGenerator>>, language: TargetLanguage) -> Self {
        Self { llm, language }
    }

    pub async fn render(&self, title: &str, report: &str) -> String {
        let Some(llm) = &self.llm else {
            return markdown_to_html(title, report);
        };

        let instruction = if self.language.use_english_prompt() {
            HTML_PROMPT_EN
        } else {
            HTML_PROMPT_ZH
        };
        let prompt = format!("{}{}", instruction, report);
        match llm.generate_text(&ModelHandle::Efficient, &prompt, &[]).await {
            Ok(answer) => {
                let html = strip_code_fences(&answer);
                if html.is_empty() {
                    warn!("模型返回了空的HTML，改用Markdown转换");
                    markdown_to_html(title, report)
                } else {
                    html
                }
            }
            Err(e) => {
                warn!("⚠️ HTML渲染失败，改用Markdown转换: {}", e);
                markdown_to_html(title, report)
            }
        }
    }
}

/// 把报告保存到输出目录
pub struct DiskOutlet {
    output_dir: PathBuf,
    language: TargetLanguage,
}

impl DiskOutlet {
    pub fn new(output_dir: impl Into<PathBuf>, language: TargetLanguage) -> Self {
        Self {
            output_dir: output_dir.into(),
            language,
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// 保存Markdown报告、可选的HTML报告以及最终的调研状态，返回写入的文件
    pub fn save(&self, report: &FinalReport, html: Option<&str>) -> Result<Vec<PathBuf>> {
        println!("\n🖊️ 报告存储中...");
        fs::create_dir_all(&self.output_dir)?;

        let file_name = self.language.report_file_name();
        let mut written = Vec::new();

        let markdown_path = self.output_dir.join(format!("{}.md", file_name));
        fs::write(&markdown_path, &report.essay)?;
        written.push(markdown_path);

        if let Some(html) = html {
            let html_path = self.output_dir.join(format!("{}.html", file_name));
            fs::write(&html_path, html)?;
            written.push(html_path);
        }

        let state_path = self.output_dir.join("research-state.json");
        fs::write(&state_path, serde_json::to_string_pretty(&report.state)?)?;
        written.push(state_path);

        for path in &written {
            println!("💾 已保存: {}", path.display());
        }
        Ok(written)
    }
}
