//! Agent runtime: tool scheduling, model routing, the agent executor and
//! interactive chat sessions.

pub mod agent_registry;
pub mod approval;
pub mod backends;
pub mod builtin;
pub mod chat;
pub mod executor;
pub mod llm;
pub mod model_router;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod subagent;
