//! # garde-archive
//!
//! A local archive of conversations, handoffs and notes, digested by an
//! external model into structured extractions and made searchable with
//! SQLite FTS5.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌─────────┐   ┌──────────┐
//! │ Adapters │──▶│ Chunker │──▶│ Invoker  │──▶│ Merger  │──▶│  Store   │
//! │ (JSONL)  │   │         │   │ (claude) │   │         │   │ + FTS5   │
//! └──────────┘   └─────────┘   └──────────┘   └────┬────┘   └──────────┘
//!                                                  │              ▲
//!                                                  ▼              │
//!                                            ┌──────────┐         │
//!                                            │ Resolver │─────────┘
//!                                            │(glossary)│
//!                                            └──────────┘
//! ```
//!
//! The batch orchestrator drives one source at a time and commits after
//! each. A source's `status` column is the only checkpoint.
//!
//! ## Quick Start
//!
//! ```bash
//! garde init
//! garde ingest sources.jsonl
//! garde backfill --limit 20
//! garde search "claude-memory"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Pipeline error type |
//! | [`models`] | Core data types |
//! | [`chunk`] | Topic-aware content chunking |
//! | [`invoke`] | Extraction backend and prompt handling |
//! | [`guard`] | Recursion guard |
//! | [`merge`] | Multi-chunk result merging |
//! | [`store`] | Transactional persistence |
//! | [`index`] | FTS index synchronization |
//! | [`resolver`] | Glossary-based entity resolution |
//! | [`staging`] | Staged extraction hand-off |
//! | [`batch`] | Batch orchestration |
//! | [`backfill`] | Pipeline commands |
//! | [`ingest`] | Source record ingest and pruning |
//! | [`review`] | Entity review queue commands |
//! | [`search`] | Lexical search |
//! | [`stats`] | Status report |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod backfill;
pub mod batch;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod index;
pub mod ingest;
pub mod invoke;
pub mod merge;
pub mod migrate;
pub mod models;
pub mod resolver;
pub mod review;
pub mod search;
pub mod staging;
pub mod stats;
pub mod store;
