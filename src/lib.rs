pub mod agent;
pub mod cli;
pub mod config;
pub mod errors;
pub mod i18n;
pub mod knowledge;
pub mod llm;
pub mod outlet;
pub mod progress;
pub mod research;
pub mod retrieval;
pub mod search;
pub mod tools;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use errors::{ResearchError, ToolError};
pub use progress::{EventStream, ProgressSink};
pub use research::{
    FinalReport, ResearchContext, ResearchOutcome, TrajectoryController, run_research,
    run_research_at, run_research_with_cancel,
};
pub use types::{EventKind, ResearchEvent};
