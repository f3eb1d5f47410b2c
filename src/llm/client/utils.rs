use crate::{
    config::LLMConfig,
    llm::ModelHandle,
    utils::token_estimator::TokenEstimator,
};

use std::sync::LazyLock;

static TOKEN_ESTIMATOR: LazyLock<TokenEstimator> = LazyLock::new(TokenEstimator::new);

/// 高能效模型能够稳定处理的提示词规模
const EFFICIENT_TOKEN_LIMIT: usize = 12 * 1024;

/// 根据调用方指定的模型和提示词长度，决定实际使用的模型以及失败时的备选模型
pub fn evaluate_befitting_model(
    llm_config: &LLMConfig,
    model: &ModelHandle,
    system_prompt: &str,
    user_prompt: &str,
) -> (String, Option<String>) {
    match model {
        ModelHandle::Named(name) => (name.clone(), None),
        ModelHandle::Powerful => (llm_config.model_powerful.clone(), None),
        ModelHandle::Efficient => {
            let tokens = TOKEN_ESTIMATOR.estimate_tokens(system_prompt)
                + TOKEN_ESTIMATOR.estimate_tokens(user_prompt);
            if tokens <= EFFICIENT_TOKEN_LIMIT
                && llm_config.model_efficient != llm_config.model_powerful
            {
                return (
                    llm_config.model_efficient.clone(),
                    Some(llm_config.model_powerful.clone()),
                );
            }
            (llm_config.model_powerful.clone(), None)
        }
    }
}
