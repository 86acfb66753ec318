pub mod models;
pub mod queries;

pub use queries::{
    init_db, AgentRepo, CallRepo, DbPool, KnowledgeChunkRepo, PhoneRepo, RetryAttemptRepo,
    ScheduledCallRepo,
};
