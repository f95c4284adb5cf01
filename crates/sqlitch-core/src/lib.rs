//! # sqlitch-core
//!
//! Core engine behind the `sqlitch` CLI: a drop-in reimplementation of the
//! Sqitch database change management tool.
//!
//! The crate is organized around the lifecycle of a change:
//!
//! - [`plan`] — the ordered plan of changes and tags: parser, formatter,
//!   change/tag identity, symbolic references, and rework.
//! - [`config`] — the three-scope (system/user/local) Git-style
//!   configuration hierarchy with environment overrides.
//! - [`migrations`] — the per-engine registry SQL catalog, byte-matched to
//!   the upstream Sqitch reference files.
//! - [`engine`] — engine adapters over workspace and registry connections;
//!   SQLite is the reference implementation.
//! - [`registry`] — the state recorder for the `projects`, `changes`,
//!   `tags`, `dependencies`, `events`, and `releases` tables.
//! - [`deploy`] — the deploy/revert/verify execution engines.
//! - [`logging`] — the structured, redacting logger contract.
//!
//! All filesystem writes (plan, config) are atomic: write a temp sibling,
//! fsync, rename into place.

pub mod config;
pub mod context;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod identity;
pub mod logging;
pub mod migrations;
pub mod plan;
pub mod registry;
pub mod script;
pub mod templates;
