pub mod html;
pub mod json;
pub mod threads;
pub mod token_estimator;
