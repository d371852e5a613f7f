//! # Quakedex
//!
//! An event association and product indexing engine for seismic data feeds.
//!
//! Quakedex ingests versioned "products" (origins, magnitudes, maps, and
//! administrative records) from independent reporting networks, clusters
//! them into logical events, keeps a deterministic preferred record per
//! product type, and notifies listeners of every change. Events merge when
//! new information connects them and split when it divides them; archive
//! policies retire old records on a schedule.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────────┐
//! │ Products │──▶│    Indexer     │──▶│    SQLite     │
//! │  (feeds) │   │ associate/merge│   │ events+products│
//! └──────────┘   └──────┬────────┘   └──────┬───────┘
//!                       │                   │
//!            ┌──────────┤            ┌──────┴───────┐
//!            ▼          ▼            ▼              ▼
//!      ┌──────────┐ ┌─────────┐ ┌─────────┐  ┌──────────┐
//!      │Listeners │ │ Archive │ │   CLI   │  │  Search  │
//!      │ (change) │ │ sweeper │ │  (qdx)  │  │ requests │
//!      └──────────┘ └─────────┘ └─────────┘  └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! qdx init                      # create database
//! qdx ingest product.json       # index a product
//! qdx search --source us        # list matching events
//! qdx sweep                     # run archive policies once
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types: products, summaries, events |
//! | [`summary`] | Summarizer module registry |
//! | [`associate`] | Association rules and windows |
//! | [`query`] | Index queries and search requests |
//! | [`index`] | SQLite-backed product index |
//! | [`storage`] | Product payload storage |
//! | [`graph`] | Connected components for split checks |
//! | [`indexer`] | The association engine |
//! | [`dispatch`] | Change notification fan-out |
//! | [`archive`] | Archive policies and sweeper |
//! | [`error`] | Domain error types |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod archive;
pub mod associate;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod index;
pub mod indexer;
pub mod migrate;
pub mod models;
pub mod query;
pub mod storage;
pub mod summary;
