//! # llm-relay
//!
//! A chat backend that routes each conversational turn to one of two
//! hosted chat-completion gateways, enriches it with retrieved or attached
//! file context, and keeps per-session conversation memory.
//!
//! ## Architecture
//!
//! ```text
//!             ┌──────────────┐
//!  turn ────▶ │ Orchestrator │──▶ ModelRouter ──▶ Provider ──▶ gateway
//!             └──────┬───────┘    (primary / secondary)
//!                    │
//!                    ▼
//!           ┌──────────────────┐
//!           │ RetrievalManager │
//!           └───┬──────────┬───┘
//!               ▼          ▼
//!         LocalStore   RemoteStore
//!        (in memory,   (PostgREST
//!         on disk)      vectors)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`router`] | Model name to gateway binding |
//! | [`provider`] | Chat-completion clients (async, blocking, streaming) |
//! | [`orchestrator`] | Per-session turn state machine and memory |
//! | [`local_store`] | In-process vector index with disk persistence |
//! | [`remote_store`] | REST vector store with server or client ranking |
//! | [`retrieval`] | Remote-first writes, local reads, merged stats |
//! | [`extract`] | PDF, DOCX, XLSX, CSV and text decoding |
//! | [`embedding`] | Embedding providers |
//! | [`sessions`] | Bounded session cache |
//! | [`health`] | Startup capability check |
//! | [`history`] | Chat history and upload records |
//! | [`reminders`] | Dated reminders in SQLite |
//! | [`tools`] | Tools the model can call (reminders, file summaries) |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`error`] | Typed provider and store errors |
//! | [`chat_cmd`], [`ingest`], [`search`], [`stats`] | CLI commands |

pub mod chat_cmd;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod health;
pub mod history;
pub mod ingest;
pub mod local_store;
pub mod migrate;
pub mod orchestrator;
pub mod provider;
pub mod reminders;
pub mod remote_store;
pub mod retrieval;
pub mod router;
pub mod search;
pub mod server;
pub mod sessions;
pub mod stats;
pub mod tools;
