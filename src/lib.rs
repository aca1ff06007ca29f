//! # ragchat
//!
//! A retrieval-augmented chat service with streaming delivery and
//! conversation-scoped document isolation.
//!
//! Clients chat over an SSE endpoint; each turn embeds the message,
//! retrieves context from two partitions of a SQLite-backed vector index
//! (shared knowledge base plus the conversation's own uploads), assembles
//! a prompt, and streams the model's answer token by token while the full
//! text is accumulated for persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌───────────┐
//! │ Uploads  │──▶│   Ingestion    │──▶│  SQLite    │
//! │ KB files │   │ Extract+Chunk │   │ vectors +  │
//! └──────────┘   │    +Embed     │   │ messages   │
//!                └───────────────┘   └─────┬─────┘
//!                                          │
//!                   ┌──────────────────────┤
//!                   ▼                      ▼
//!              ┌──────────┐         ┌───────────┐
//!              │ Retrieval │────────▶│ Streaming │──▶ SSE client
//!              │ (2 scopes)│ context │Completion │
//!              └──────────┘         └───────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy mapped to the HTTP contract |
//! | [`models`] | Core data types |
//! | [`extract`] | PDF/CSV/spreadsheet text extraction |
//! | [`chunk`] | Text chunking (upload and knowledge-base paths) |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`vector`] | Scope-filtered vector index over SQLite |
//! | [`ingest`] | Extract → chunk → embed → upsert pipeline |
//! | [`store`] | Conversation and message persistence |
//! | [`retrieval`] | Dual-scope retrieval engine |
//! | [`context`] | Prompt context assembly |
//! | [`completion`] | Streaming chat-completion client |
//! | [`chat`] | Streaming turn driver |
//! | [`server`] | HTTP API |

pub mod chat;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retrieval;
pub mod server;
pub mod store;
pub mod vector;
