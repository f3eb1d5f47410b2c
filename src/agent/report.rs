use std::sync::Arc;

use anyhow::{Result, anyhow};
use tracing::info;

use crate::i18n::TargetLanguage;
use crate::llm::{ModelHandle, TextGenerator};
use crate::progress::ProgressSink;
use crate::types::{EventKind, ResearchState};

/// 最终报告撰写者，只在调研结束时调用
pub struct ReportGenerator {
    llm: Arc<dyn TextGenerator>,
    model: ModelHandle,
    language: TargetLanguage,
}

impl ReportGenerator {
    pub fn new(llm: Arc<dyn TextGenerator>, language: TargetLanguage) -> Self {
        Self {
            llm,
            model: ModelHandle::Powerful,
            language,
        }
    }

    pub fn with_model(mut self, model: ModelHandle) -> Self {
        self.model = model;
        self
    }

    fn build_prompt(&self, state: &ResearchState) -> String {
        let mut prompt = format!(
            "Write a research report in Markdown for the goal below, as of {}.\n\n# Goal\n{}\n\n# Knowledge\n",
            state.research_datetime.format("%Y-%m-%d"),
            state.goal
        );
        let knowledge = state.knowledge.active_items();
        if knowledge.is_empty() {
            prompt.push_str("(no knowledge was collected)\n");
        }
        for (i, item) in knowledge.iter().enumerate() {
            let sources: Vec<&str> = item.sources.iter().map(String::as_str).collect();
            prompt.push_str(&format!(
                "[{}] {}\nSources: {}\n\n",
                i + 1,
                item.content,
                sources.join(", ")
            ));
        }
        prompt.push_str(
            "\nBase every statement on the knowledge above and cite the sources. \
             Do not use information published after the research datetime.\n",
        );
        prompt.push_str(self.language.prompt_instruction());
        prompt
    }

    /// 撰写报告，前后分别发出开始与完成事件；空报告视为失败
    pub async fn generate(&self, state: &ResearchState, sink: &ProgressSink) -> Result<String> {
        sink.emit(EventKind::GenerateEssayStart {
            goal: state.goal.clone(),
        });

        let prompt = self.build_prompt(state);
        let essay = self
            .llm
            .generate_text(&self.model, &prompt, &[])
            .await?
            .trim()
            .to_string();
        if essay.is_empty() {
            return Err(anyhow!("模型返回了空的调研报告"));
        }

        info!(chars = essay.chars().count(), "✅ 调研报告撰写完成");
        sink.emit(EventKind::GenerateEssayComplete {
            essay: essay.clone(),
        });
        Ok(essay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatTurn;
    use crate::types::KnowledgeItem;
    use async_trait::async_trait;
    use chrono::Utc;

    struct Echo(&'static str);

    #[async_trait]
    impl TextGenerator for Echo {
        async fn generate_text(
            &self,
            _model: &ModelHandle,
            _prompt: &str,
            _context: &[ChatTurn],
        ) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[tokio::test]
    async fn test_generate_brackets_essay_with_events() {
        let generator = ReportGenerator::new(Arc::new(Echo("# Report\nbody")), TargetLanguage::English);
        let mut state = ResearchState::new("goal", Utc::now());
        state
            .knowledge
            .append(vec![KnowledgeItem::new("fact", ["https://a"])]);
        let (sink, mut stream) = ProgressSink::channel();

        let essay = generator.generate(&state, &sink).await.unwrap();

        assert_eq!(essay, "# Report\nbody");
        let events = stream.drain_ready();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind_name(), "generate_essay_start");
        assert!(matches!(
            &events[1].event,
            EventKind::GenerateEssayComplete { essay } if essay == "# Report\nbody"
        ));
    }

    #[tokio::test]
    async fn test_empty_essay_is_an_error() {
        let generator = ReportGenerator::new(Arc::new(Echo("   ")), TargetLanguage::Chinese);
        let state = ResearchState::new("goal", Utc::now());
        let (sink, mut stream) = ProgressSink::channel();

        assert!(generator.generate(&state, &sink).await.is_err());
        let kinds: Vec<&str> = stream.drain_ready().iter().map(|e| e.kind_name()).collect();
        assert_eq!(kinds, vec!["generate_essay_start"]);
    }

    #[test]
    fn test_prompt_lists_knowledge_with_sources() {
        let generator = ReportGenerator::new(Arc::new(Echo("")), TargetLanguage::English);
        let mut state = ResearchState::new("battery market", Utc::now());
        state
            .knowledge
            .append(vec![KnowledgeItem::new("Prices fell", ["https://a", "https://b"])]);

        let prompt = generator.build_prompt(&state);
        assert!(prompt.contains("[1] Prices fell"));
        assert!(prompt.contains("Sources: https://a, https://b"));
    }
}
