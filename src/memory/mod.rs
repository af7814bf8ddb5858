//! Attention-weighted working memory per reasoning session

pub mod item;
pub mod manager;
pub mod session;

pub use item::{ItemPhase, WorkingMemoryItem};
pub use manager::{SessionId, WorkingMemoryManager};
pub use session::{GoalContext, GoalTarget, StageOutcome, StageRequest, WorkingMemory};
