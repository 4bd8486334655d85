//! Error rendering for user-visible run summaries
//!
//! The rendering mode is chosen per engine (and therefore per run) and passed
//! explicitly into [`render_error`]; there is no process-wide switch.

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;

/// How much of an error chain ends up in a persisted summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RenderingMode {
    /// Outermost message followed by every `source()` cause
    #[default]
    Verbose,
    /// Outermost message only; causes may carry hosts, paths or SQL
    Sanitized,
}

impl std::str::FromStr for RenderingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "verbose" | "full" => Ok(RenderingMode::Verbose),
            "sanitized" | "redacted" => Ok(RenderingMode::Sanitized),
            other => Err(format!("Invalid rendering mode: {other}")),
        }
    }
}

impl std::fmt::Display for RenderingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenderingMode::Verbose => f.write_str("verbose"),
            RenderingMode::Sanitized => f.write_str("sanitized"),
        }
    }
}

/// Render an error for storage in `summary.error`
pub fn render_error(err: &(dyn StdError + 'static), mode: RenderingMode) -> String {
    let mut rendered = err.to_string();

    if mode == RenderingMode::Verbose {
        let mut source = err.source();
        while let Some(cause) = source {
            let cause_text = cause.to_string();
            // thiserror's `#[error("...: {0}")]` already embeds the cause
            if !rendered.contains(&cause_text) {
                rendered.push_str(": ");
                rendered.push_str(&cause_text);
            }
            source = cause.source();
        }
    }

    rendered
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("source unreadable")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    fn sample() -> Outer {
        Outer {
            inner: std::io::Error::new(std::io::ErrorKind::NotFound, "/srv/uploads/a.csv missing"),
        }
    }

    #[test]
    fn test_verbose_includes_causes() {
        let rendered = render_error(&sample(), RenderingMode::Verbose);
        assert_eq!(rendered, "source unreadable: /srv/uploads/a.csv missing");
    }

    #[test]
    fn test_sanitized_hides_causes() {
        let rendered = render_error(&sample(), RenderingMode::Sanitized);
        assert_eq!(rendered, "source unreadable");
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Sanitized".parse::<RenderingMode>().unwrap(), RenderingMode::Sanitized);
        assert_eq!("full".parse::<RenderingMode>().unwrap(), RenderingMode::Verbose);
        assert!("quiet".parse::<RenderingMode>().is_err());
    }
}
