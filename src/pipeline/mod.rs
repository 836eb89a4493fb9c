//! Conversation turn pipeline.

pub mod coordinator;
pub mod memory;
pub mod messages;
pub mod window;

pub use coordinator::{TurnOrchestrator, TurnOutcome, TurnState};
pub use memory::MemoryKeywords;
pub use messages::MessageLog;
pub use window::build_prompt_window;
