pub mod event;
pub mod research;
pub mod tool;

pub use event::{EventKind, ResearchEvent};
pub use research::{
    ActionChoice, KnowledgeItem, Page, QuerySummary, ResearchSnapshot, ResearchState, SearchQuery,
    parse_research_datetime,
};
pub use tool::{CodeResult, RetrievalResult};
