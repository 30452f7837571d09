//! # llm-relay core
//!
//! Shared, I/O-free logic for llm-relay: chunk and message models,
//! recursive text splitting, the [`Embedder`](embedding::Embedder) trait,
//! and the in-memory similarity index with its ranking function.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.
//! Persistence, network clients, and embedding backends live in the
//! `llm-relay` application crate.

pub mod chunk;
pub mod embedding;
pub mod index;
pub mod models;
