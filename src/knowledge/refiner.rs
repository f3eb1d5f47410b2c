//! 知识精炼 - 按主题重叠分组并交叉验证合并

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::i18n::TargetLanguage;
use crate::knowledge::KnowledgeStore;
use crate::llm::{ModelHandle, TextGenerator};
use crate::types::KnowledgeItem;

/// 把文本切分为用于重叠比较的词元：拉丁字母数字按词切分，CJK字符逐字切分
pub fn tokenize(text: &str) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    let mut word = String::new();

    for ch in text.chars() {
        if is_cjk(ch) {
            flush_word(&mut word, &mut tokens);
            tokens.insert(ch.to_string());
        } else if ch.is_alphanumeric() {
            word.extend(ch.to_lowercase());
        } else {
            flush_word(&mut word, &mut tokens);
        }
    }
    flush_word(&mut word, &mut tokens);
    tokens
}

fn flush_word(word: &mut String, tokens: &mut BTreeSet<String>) {
    if word.chars().count() >= 2 {
        tokens.insert(std::mem::take(word));
    } else {
        word.clear();
    }
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32, 0x4E00..=0x9FFF | 0x3400..=0x4DBF | 0xF900..=0xFAFF)
}

/// 两段文本的Jaccard相似度
pub fn similarity(a: &str, b: &str) -> f64 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    intersection / union
}

/// 把相似度不低于阈值的知识点（传递闭包）分为一组，只返回包含至少两个成员的组
pub fn group_overlapping(items: &[&KnowledgeItem], threshold: f64) -> Vec<Vec<usize>> {
    let mut parent: Vec<usize> = (0..items.len()).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..items.len() {
        for j in (i + 1)..items.len() {
            if similarity(&items[i].content, &items[j].content) >= threshold {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj.max(ri)] = ri.min(rj);
                }
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut roots: Vec<usize> = Vec::new();
    for i in 0..items.len() {
        let root = find(&mut parent, i);
        match roots.iter().position(|r| *r == root) {
            Some(pos) => groups[pos].push(i),
            None => {
                roots.push(root);
                groups.push(vec![i]);
            }
        }
    }

    groups.into_iter().filter(|g| g.len() >= 2).collect()
}

/// 知识合并策略
#[async_trait]
pub trait KnowledgeRefiner: Send + Sync {
    /// 把一组互相重叠的知识点合并为一段经过交叉验证的内容
    async fn merge(&self, goal: &str, group: &[&KnowledgeItem]) -> Result<String>;
}

/// 确定性的合并策略：以最长的内容为基础，补充其他成员中未出现的句子
#[derive(Debug, Default, Clone)]
pub struct OverlapRefiner;

impl OverlapRefiner {
    fn sentences(content: &str) -> Vec<String> {
        content
            .split(['.', '。', '!', '！', '?', '？', ';', '；', '\n'])
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[async_trait]
impl KnowledgeRefiner for OverlapRefiner {
    async fn merge(&self, _goal: &str, group: &[&KnowledgeItem]) -> Result<String> {
        let mut members: Vec<&&KnowledgeItem> = group.iter().collect();
        members.sort_by(|a, b| {
            b.content
                .len()
                .cmp(&a.content.len())
                .then_with(|| a.id.cmp(&b.id))
        });

        let base = members
            .first()
            .ok_or_else(|| anyhow!("不能合并空的知识点分组"))?;
        let mut merged = base.content.trim().to_string();
        let mut merged_lower = merged.to_lowercase();

        for member in members.iter().skip(1) {
            for sentence in Self::sentences(&member.content) {
                if !merged_lower.contains(&sentence.to_lowercase()) {
                    merged.push(' ');
                    merged.push_str(&sentence);
                    merged.push('.');
                    merged_lower = merged.to_lowercase();
                }
            }
        }
        Ok(merged)
    }
}

/// 借助大模型进行交叉验证和合并
pub struct LlmRefiner {
    llm: Arc<dyn TextGenerator>,
    model: ModelHandle,
    language: TargetLanguage,
}

impl LlmRefiner {
    pub fn new(llm: Arc<dyn TextGenerator>, model: ModelHandle, language: TargetLanguage) -> Self {
        Self {
            llm,
            model,
            language,
        }
    }

    fn build_prompt(&self, goal: &str, group: &[&KnowledgeItem]) -> String {
        let mut prompt = format!(
            "You are cross-validating research notes for the goal: {}\n\n\
             The following knowledge items overlap. Merge them into ONE accurate statement. \
             Keep every number, date and qualifier that the items agree on; when they conflict, \
             state the conflict explicitly. Do not add facts that are not present.\n\n",
            goal
        );
        for (i, item) in group.iter().enumerate() {
            prompt.push_str(&format!(
                "<item index=\"{}\" sources=\"{}\">\n{}\n</item>\n",
                i + 1,
                item.sources.iter().cloned().collect::<Vec<_>>().join(", "),
                item.content
            ));
        }
        prompt.push_str("\nReturn only the merged statement.\n");
        prompt.push_str(self.language.prompt_instruction());
        prompt
    }
}

#[async_trait]
impl KnowledgeRefiner for LlmRefiner {
    async fn merge(&self, goal: &str, group: &[&KnowledgeItem]) -> Result<String> {
        let prompt = self.build_prompt(goal, group);
        let merged = self.llm.generate_text(&self.model, &prompt, &[]).await?;
        let merged = merged.trim().to_string();
        if merged.is_empty() {
            return Err(anyhow!("模型返回了空的精炼结果"));
        }
        Ok(merged)
    }
}

/// 一次精炼的前后对比
#[derive(Debug, Clone, PartialEq)]
pub struct RefinementOutcome {
    /// 精炼前的有效知识点
    pub original_items: Vec<KnowledgeItem>,
    /// 精炼后的有效知识点
    pub refined_items: Vec<KnowledgeItem>,
    /// 本次新追加的精炼知识点
    pub added_items: Vec<KnowledgeItem>,
}

/// 对知识库执行精炼，直到没有可合并的分组为止
///
/// 知识库自上次精炼后没有变化时直接返回None，因此重复调用不会产生新的精炼知识点
pub async fn refine_knowledge(
    store: &mut KnowledgeStore,
    refiner: &dyn KnowledgeRefiner,
    goal: &str,
    threshold: f64,
) -> Result<Option<RefinementOutcome>> {
    if store.is_refined_at_current_revision() {
        debug!("知识库自上次精炼后没有变化，跳过");
        return Ok(None);
    }

    let original_items: Vec<KnowledgeItem> = store.active_items().into_iter().cloned().collect();
    let mut added_items = Vec::new();

    loop {
        let active: Vec<KnowledgeItem> = store.active_items().into_iter().cloned().collect();
        let refs: Vec<&KnowledgeItem> = active.iter().collect();
        let groups = group_overlapping(&refs, threshold);
        if groups.is_empty() {
            break;
        }

        let mut batch = Vec::with_capacity(groups.len());
        for group in &groups {
            let members: Vec<&KnowledgeItem> = group.iter().map(|&i| refs[i]).collect();
            let content = refiner.merge(goal, &members).await?;
            batch.push(KnowledgeItem::refined(content, &members));
        }

        let added = store.apply_refinement(batch);
        if added.is_empty() {
            break;
        }
        added_items.extend(added);
    }

    store.mark_refined();

    if added_items.is_empty() {
        return Ok(None);
    }

    let refined_items: Vec<KnowledgeItem> = store.active_items().into_iter().cloned().collect();
    info!(
        before = original_items.len(),
        after = refined_items.len(),
        "🔄 知识精炼完成"
    );
    Ok(Some(RefinementOutcome {
        original_items,
        refined_items,
        added_items,
    }))
}
