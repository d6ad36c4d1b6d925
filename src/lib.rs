//! # Estate Harness
//!
//! ETL and retrieval toolkit for a real-estate portfolio. Documents found on
//! disk are extracted, chunked, embedded and linked to the properties they
//! describe; rent-roll spreadsheets populate units, tenants and leases; a set
//! of read-only query tools reports on the result.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌───────────┐   ┌──────────────┐
//! │   scan   │──▶│ extract / ocr  │──▶│   chunk   │──▶│ SQLite       │
//! │ walkdir  │   │ pdf/docx/xlsx  │   │ + embed   │   │ FTS5 + vecs  │
//! └──────────┘   └────────────────┘   └───────────┘   └──────┬───────┘
//!                                                            │
//!        ┌──────────────┬──────────────┬─────────────────────┤
//!        ▼              ▼              ▼                     ▼
//!   ┌─────────┐   ┌──────────┐   ┌───────────┐        ┌────────────┐
//!   │  link   │   │ rentroll │   │  search   │        │   query    │
//!   │ scoring │   │ import   │   │ kw/vec/hy │        │ read-only  │
//!   └─────────┘   └──────────┘   └───────────┘        └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! estate init                       # create database, seed properties
//! estate ingest                     # extract, chunk and embed documents
//! estate link                       # attach chunks to properties
//! estate import roll.xlsx --property "Gare 28"
//! estate import-register contrats.xlsx --kind maintenance --property "Gare 28"
//! estate search "bail parking" --mode hybrid
//! estate properties dashboard gare
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | Connections and schema |
//! | [`models`] | Core data types |
//! | [`scan`] / [`extract`] / [`ocr`] | Finding and reading files |
//! | [`chunk`] / [`embedding`] / [`embed_cmd`] | Chunking and vectors |
//! | [`ingest`] | The ingestion pass |
//! | [`classify`] / [`link`] | Categories, unit types, property detection |
//! | [`rentroll`] / [`register`] / [`validate`] / [`cleanup`] | Structured data import and repair |
//! | [`search`] / [`query`] / [`get`] / [`stats`] | Read side |

pub mod chunk;
pub mod classify;
pub mod cleanup;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod extract;
pub mod get;
pub mod ingest;
pub mod link;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod progress;
pub mod query;
pub mod register;
pub mod rentroll;
pub mod scan;
pub mod search;
pub mod stats;
pub mod validate;
