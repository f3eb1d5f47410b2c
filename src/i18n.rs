use serde::{Deserialize, Serialize};

/// 目标语言类型
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetLanguage {
    #[serde(rename = "zh")]
    #[default]
    Chinese,
    #[serde(rename = "en")]
    English,
}

impl std::fmt::Display for TargetLanguage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetLanguage::Chinese => write!(f, "zh"),
            TargetLanguage::English => write!(f, "en"),
        }
    }
}

impl std::str::FromStr for TargetLanguage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "zh" | "chinese" | "中文" => Ok(TargetLanguage::Chinese),
            "en" | "english" | "英文" => Ok(TargetLanguage::English),
            _ => Err(format!("Unknown target language: {}", s)),
        }
    }
}

impl TargetLanguage {
    /// 获取语言的描述性名称
    pub fn display_name(&self) -> &'static str {
        match self {
            TargetLanguage::Chinese => "中文",
            TargetLanguage::English => "English",
        }
    }

    /// 获取语言的提示词指令
    pub fn prompt_instruction(&self) -> &'static str {
        match self {
            TargetLanguage::Chinese => "请使用中文回答，确保表述准确、专业、易于理解。",
            TargetLanguage::English => {
                "Please answer in English, ensuring accurate, professional, and easy-to-understand language."
            }
        }
    }

    /// 是否使用英文提示词
    pub fn use_english_prompt(&self) -> bool {
        matches!(self, TargetLanguage::English)
    }

    /// 报告文件名
    pub fn report_file_name(&self) -> &'static str {
        match self {
            TargetLanguage::Chinese => "调研报告",
            TargetLanguage::English => "research-report",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_language_aliases() {
        assert_eq!("EN".parse::<TargetLanguage>(), Ok(TargetLanguage::English));
        assert_eq!("中文".parse::<TargetLanguage>(), Ok(TargetLanguage::Chinese));
        assert!("ja".parse::<TargetLanguage>().is_err());
    }

    #[test]
    fn test_display_round_trips_through_from_str() {
        for lang in [TargetLanguage::Chinese, TargetLanguage::English] {
            assert_eq!(lang.to_string().parse::<TargetLanguage>(), Ok(lang));
        }
    }
}
