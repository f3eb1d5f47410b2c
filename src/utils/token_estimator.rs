/// Token估算器，用于控制提示词长度以及选择合适的模型
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    /// 英文字符的平均token比例（字符数/token数）
    english_char_per_token: f64,
    /// 中文字符的平均token比例
    chinese_char_per_token: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            english_char_per_token: 4.0,
            chinese_char_per_token: 1.5,
        }
    }

    /// 估算文本的token数量
    pub fn estimate_tokens(&self, text: &str) -> usize {
        let (chinese, other) = text.chars().fold((0usize, 0usize), |(c, o), ch| {
            if is_chinese_char(ch) { (c + 1, o) } else { (c, o + 1) }
        });

        (chinese as f64 / self.chinese_char_per_token).ceil() as usize
            + (other as f64 / self.english_char_per_token).ceil() as usize
    }

    /// 把文本截断到大致不超过 `max_tokens` 个token
    pub fn truncate_to_tokens(&self, text: &str, max_tokens: usize) -> String {
        if self.estimate_tokens(text) <= max_tokens {
            return text.to_string();
        }

        let mut budget = max_tokens as f64;
        let mut end = 0;
        for (idx, ch) in text.char_indices() {
            let cost = if is_chinese_char(ch) {
                1.0 / self.chinese_char_per_token
            } else {
                1.0 / self.english_char_per_token
            };
            if budget < cost {
                break;
            }
            budget -= cost;
            end = idx + ch.len_utf8();
        }
        format!("{}\n...[truncated]", &text[..end])
    }
}

fn is_chinese_char(c: char) -> bool {
    matches!(c as u32,
        0x4E00..=0x9FFF |  // CJK统一汉字
        0x3400..=0x4DBF |  // CJK扩展A
        0x20000..=0x2A6DF | // CJK扩展B
        0x2A700..=0x2EBEF | // CJK扩展C-F
        0x30000..=0x3134F   // CJK扩展G
    )
}
