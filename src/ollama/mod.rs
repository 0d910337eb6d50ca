//! Ollama LLM integration module
//!
//! Streams chat replies from Ollama's `/api/chat` endpoint and exposes them
//! to the agent loop as a [`ModelBackend`](crate::agent::ModelBackend).

pub mod client;

pub use client::{ChatClient, ChatMessage, DEFAULT_SYSTEM_PROMPT};
