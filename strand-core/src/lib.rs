//! Core types shared across the strand workspace.

pub mod agent;
pub mod config;
pub mod content;
pub mod error;
pub mod event;
pub mod routing;
pub mod tool;
pub mod tool_call;
