//! # GitWeek
//!
//! Aggregates a developer's code-hosting activity into weekly, searchable,
//! answerable records.
//!
//! GitWeek incrementally fetches commits, pull requests, issues, and
//! releases from the GitHub REST API, normalizes them into canonical
//! contributions in SQLite, indexes them for hybrid search (FTS5 keyword +
//! vector similarity), and answers natural-language questions about a
//! developer's week with evidence citations and bounded conversation
//! context.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────┐
//! │ Source (API) │──▶│  Ingestion    │──▶│  SQLite    │
//! │ commits/PRs/ │   │ Normalize +  │   │ FTS5+Vec  │
//! │ issues/rels  │   │ Upsert+Index │   │           │
//! └──────────────┘   └──────────────┘   └────┬──────┘
//!                                            │
//!                         ┌──────────────────┤
//!                         ▼                  ▼
//!                   ┌──────────┐       ┌──────────┐
//!                   │   CLI    │       │   HTTP   │
//!                   │   (gw)   │       │   API    │
//!                   └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gw init                          # create database
//! gw sync all                      # ingest configured repositories
//! gw search "pagination" --user alice --week 2024-W21
//! gw ask alice 2024-W21 "What did I work on?"
//! gw serve api                     # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | GitHub REST source client |
//! | [`normalize`] | Raw item → canonical contribution |
//! | [`ingest`] | Sync coordination, checkpoints, failure isolation |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Search document construction and index writes |
//! | [`search`] | Keyword, vector, and hybrid retrieval |
//! | [`conversation`] | Bounded per-subject dialogue threads |
//! | [`answer`] | Question-answering orchestration |
//! | [`server`] | HTTP API server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod answer;
pub mod config;
pub mod conversation;
pub mod db;
pub mod embedding;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod repos;
pub mod search;
pub mod server;
pub mod source;
