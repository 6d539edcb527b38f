//! # Theme Sync
//!
//! Watch a theme source tree, transform changed files and upload the results
//! to one or more remote theme stores.
//!
//! Every filesystem event runs one pipeline:
//!
//! - classify the path into a typed [`role::FileDescriptor`]
//! - run the transform for its role (SASS + post-processing, SVG icons and
//!   sprites, view and JSON minification, or passthrough)
//! - write the result under the output root
//! - enqueue one request per destination on the [`queue::RequestQueue`],
//!   which keeps each destination's requests in order while destinations
//!   proceed independently
//!
//! ## Usage
//!
//! ```ignore
//! use theme_sync::classifier::Classifier;
//! use theme_sync::config::Config;
//!
//! let config = Arc::new(Config::from_toml_str(&root, &raw)?);
//! let descriptor = Classifier::new(config).classify(&path)?;
//! ```

/// One-shot build of the whole source tree
pub mod build;

/// Path to file descriptor classification
pub mod classifier;

/// Remote theme asset API client
pub mod client;

/// CLI arguments and runtime configuration
pub mod config;

/// Event dispatch: transform, write, enqueue
pub mod dispatch;

/// Error types for the sync pipeline
pub mod error;

/// Source scanning and output writing
pub mod files;

/// Tracing subscriber setup
pub mod logging;

/// Per-destination ordered request queue
pub mod queue;

/// Roles, keys and file descriptors
pub mod role;

/// Atomic counters for builds and deliveries
pub mod stats;

/// Per-role transforms
pub mod transform;

/// Polling filesystem watcher
pub mod watcher;
