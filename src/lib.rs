//! inkline: a language server for ink narrative scripts
//!
//! This crate provides the core of the `inkline` binary: an index of the
//! story graph (knots, stitches, diverts, variables and `INCLUDE`s) and the
//! editor features built on it.
//!
//! # Overview
//!
//! - **Story index**: every `.ink` file under the project root, parsed line by
//!   line, plus the include graph between them (petgraph-based)
//! - **Navigation**: go-to-definition, find-references and symbols for knots,
//!   stitches and variables
//! - **Autocomplete**: divert targets after `->` and `<-`
//! - **Hover**: knot signatures with their leading `/** ... */` comments
//! - **Diagnostics**: include problems, duplicate knots and compiler errors,
//!   optionally through a self-healing compile for the pixi-vn dialect
//!
//! # Architecture
//!
//! - [`story`]: parsing, the story index and include resolution
//! - [`compiler`]: the contract around an external ink compiler and the
//!   self-healing loop
//! - [`config`]: layered settings snapshots
//! - [`server`]: the tower-lsp backend that routes editor events
//! - [`cli`]: one-shot `check`, `outline` and `compile` runs
//!
//! ```ignore
//! use inkline::story::Story;
//! use inkline::config::Settings;
//!
//! let settings = Settings::new(&root)?;
//! let story = Story::construct_story(&settings, &settings.project_root(&root));
//! ```

// Core modules - story index and compiler bridge
pub mod compiler;
pub mod story;

// LSP feature modules
pub mod completion;
pub mod diagnostics;
pub mod gotodef;
pub mod hover;
pub mod references;
pub mod symbol;

// Configuration and front ends
pub mod cli;
pub mod config;
pub mod server;

// Test utilities (only available in test builds)
#[cfg(test)]
pub mod test_utils;
