#[cfg(test)]
mod tests {
    use crate::cli::Args;
    use crate::config::{LLMProvider, RefinementPolicy, SelectorKind};
    use crate::i18n::TargetLanguage;
    use clap::Parser;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// 写入一个空配置文件，避免测试受当前目录下配置文件的影响
    fn empty_config() -> (TempDir, String) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("deep-research.toml");
        std::fs::write(&path, "").unwrap();
        let path = path.to_string_lossy().to_string();
        (temp_dir, path)
    }

    #[test]
    fn test_args_default_values() {
        let args = Args::try_parse_from(["deep-research-rs", "电池回收行业格局"]).unwrap();

        assert_eq!(args.goal, "电池回收行业格局");
        assert!(args.research_datetime.is_none());
        assert!(args.min_steps.is_none());
        assert!(args.max_steps.is_none());
        assert!(!args.verbose);
        assert!(!args.no_code);
        assert!(!args.no_html);
    }

    #[test]
    fn test_goal_is_required() {
        assert!(Args::try_parse_from(["deep-research-rs"]).is_err());
    }

    #[test]
    fn test_args_short_options() {
        let args = Args::try_parse_from([
            "deep-research-rs",
            "goal",
            "-t",
            "2024-06-30 12:00:00",
            "-o",
            "/tmp/out",
            "-c",
            "/tmp/cfg.toml",
            "-v",
        ])
        .unwrap();

        assert_eq!(args.research_datetime.as_deref(), Some("2024-06-30 12:00:00"));
        assert_eq!(args.output_path, Some(PathBuf::from("/tmp/out")));
        assert_eq!(args.config, Some(PathBuf::from("/tmp/cfg.toml")));
        assert!(args.verbose);
    }

    #[test]
    fn test_research_request_parses_datetime() {
        let args =
            Args::try_parse_from(["deep-research-rs", " goal ", "-t", "2024-06-30 12:00:00"])
                .unwrap();
        let request = args.research_request().unwrap();

        assert_eq!(request.goal, "goal");
        assert_eq!(request.research_datetime.to_rfc3339(), "2024-06-30T12:00:00+00:00");
    }

    #[test]
    fn test_research_request_rejects_bad_input() {
        let args = Args::try_parse_from(["deep-research-rs", "goal", "-t", "yesterday"]).unwrap();
        assert!(args.research_request().is_err());

        let args = Args::try_parse_from(["deep-research-rs", "   "]).unwrap();
        assert!(args.research_request().is_err());
    }

    #[test]
    fn test_into_config_overrides() {
        let (_dir, config_path) = empty_config();
        let args = Args::try_parse_from([
            "deep-research-rs",
            "goal",
            "--config",
            &config_path,
            "--min-steps",
            "2",
            "--max-steps",
            "5",
            "--selector",
            "heuristic",
            "--refinement-policy",
            "periodic:2",
            "--llm-provider",
            "deepseek",
            "--llm-api-key",
            "sk-cli",
            "--model-efficient",
            "deepseek-chat",
            "--target-language",
            "en",
            "--embeddings",
            "/data/docs.json",
            "--no-code",
            "--no-html",
        ])
        .unwrap();

        let config = args.into_config().unwrap();
        assert_eq!(config.research.min_steps, 2);
        assert_eq!(config.research.max_steps, 5);
        assert_eq!(config.research.selector, SelectorKind::Heuristic);
        assert_eq!(
            config.research.refinement_policy,
            RefinementPolicy::Periodic { every: 2 }
        );
        assert_eq!(config.llm.provider, LLMProvider::DeepSeek);
        assert_eq!(config.llm.api_key, "sk-cli");
        assert_eq!(config.llm.model_efficient, "deepseek-chat");
        assert_eq!(config.target_language, TargetLanguage::English);
        assert!(config.retrieval.enabled);
        assert_eq!(
            config.retrieval.embeddings_path,
            Some(PathBuf::from("/data/docs.json"))
        );
        assert!(!config.code.enabled);
        assert!(!config.render_html);
    }

    #[test]
    fn test_into_config_rejects_inverted_budget() {
        let (_dir, config_path) = empty_config();
        let args = Args::try_parse_from([
            "deep-research-rs",
            "goal",
            "--config",
            &config_path,
            "--min-steps",
            "6",
            "--max-steps",
            "2",
        ])
        .unwrap();
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_into_config_rejects_unknown_selector() {
        let (_dir, config_path) = empty_config();
        let args = Args::try_parse_from([
            "deep-research-rs",
            "goal",
            "--config",
            &config_path,
            "--selector",
            "random",
        ])
        .unwrap();
        assert!(args.into_config().is_err());
    }

    #[test]
    fn test_unknown_language_falls_back() {
        let (_dir, config_path) = empty_config();
        let args = Args::try_parse_from([
            "deep-research-rs",
            "goal",
            "--config",
            &config_path,
            "--target-language",
            "klingon",
        ])
        .unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.target_language, TargetLanguage::Chinese);
    }
}
