//! Ingestor Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared ambient concerns for the Ingestor workspace members.
//!
//! # Overview
//!
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Rendering**: turning error chains into run summaries via [`render::RenderingMode`]
//!
//! # Example
//!
//! ```no_run
//! use ingestor_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("worker started");
//!     Ok(())
//! }
//! ```

pub mod logging;
pub mod render;

// Re-export commonly used types
pub use render::{render_error, RenderingMode};
