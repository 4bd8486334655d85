//! Failure aggregation over a run's row log

use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::repository::{RunRepository, DEFAULT_FAILED_ROW_PAGE};

/// One aggregated failure reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorCount {
    pub key: String,
    pub count: u64,
}

/// Failure reasons of one run, most frequent first
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorAnalysis {
    pub run_id: Uuid,
    /// Failed rows read from the log
    pub rows_scanned: u64,
    /// Failed rows whose error payload was absent or unreadable
    pub skipped: u64,
    /// Grouped by top-level message
    pub messages: Vec<ErrorCount>,
    /// Grouped by `field: message`
    pub fields: Vec<ErrorCount>,
}

/// Read-only aggregation of logged row failures
pub struct ErrorAnalyzer {
    repository: Arc<dyn RunRepository>,
    page_size: i64,
}

impl ErrorAnalyzer {
    pub fn new(repository: Arc<dyn RunRepository>) -> Self {
        Self {
            repository,
            page_size: DEFAULT_FAILED_ROW_PAGE,
        }
    }

    pub fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Group a run's failures; `limit` caps each list
    #[tracing::instrument(skip(self))]
    pub async fn analyze(&self, run_id: Uuid, limit: Option<usize>) -> Result<ErrorAnalysis> {
        // Surfaces RunNotFound for unknown ids
        self.repository.get_run(run_id).await?;

        let mut analysis = ErrorAnalysis {
            run_id,
            ..Default::default()
        };
        let mut messages: HashMap<String, u64> = HashMap::new();
        let mut fields: HashMap<String, u64> = HashMap::new();

        let mut after = 0;
        loop {
            let page = self
                .repository
                .failed_rows(run_id, after, self.page_size)
                .await?;
            let Some(last) = page.last() else { break };
            after = last.row_number;
            let full_page = page.len() as i64 == self.page_size;

            for row in page {
                analysis.rows_scanned += 1;
                let counted = row
                    .errors
                    .as_ref()
                    .is_some_and(|errors| tally(errors, &mut messages, &mut fields));
                if !counted {
                    analysis.skipped += 1;
                }
            }

            if !full_page {
                break;
            }
        }

        analysis.messages = ranked(messages, limit);
        analysis.fields = ranked(fields, limit);

        tracing::debug!(
            rows = analysis.rows_scanned,
            skipped = analysis.skipped,
            reasons = analysis.messages.len(),
            "Analyzed run errors"
        );
        Ok(analysis)
    }
}

/// Count one row's error payload; `false` when nothing in it was readable
///
/// `message` and `fields` are read independently, so a payload written by
/// another producer with only one of them still counts.
fn tally(
    errors: &Value,
    messages: &mut HashMap<String, u64>,
    fields: &mut HashMap<String, u64>,
) -> bool {
    let mut counted = false;

    let message = errors
        .as_str()
        .or_else(|| errors.get("message").and_then(Value::as_str));
    if let Some(message) = message {
        *messages.entry(message.to_string()).or_default() += 1;
        counted = true;
    }

    if let Some(by_field) = errors.get("fields").and_then(Value::as_object) {
        for (field, field_messages) in by_field {
            let Some(field_messages) = field_messages.as_array() else {
                continue;
            };
            for message in field_messages.iter().filter_map(Value::as_str) {
                *fields.entry(format!("{field}: {message}")).or_default() += 1;
                counted = true;
            }
        }
    }
    counted
}

/// Count descending, then key ascending
fn ranked(counts: HashMap<String, u64>, limit: Option<usize>) -> Vec<ErrorCount> {
    let mut ranked: Vec<ErrorCount> = counts
        .into_iter()
        .map(|(key, count)| ErrorCount { key, count })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));
    if let Some(limit) = limit {
        ranked.truncate(limit);
    }
    ranked
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::repository::InMemoryRunRepository;
    use crate::types::{Actor, CreateRunParams, NewIngestRow, RowError, RowStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn failed(row_number: i64, error: Option<RowError>) -> NewIngestRow {
        NewIngestRow {
            row_number,
            status: RowStatus::Failed,
            data: json!({ "row": row_number }).as_object().cloned().unwrap(),
            errors: error,
        }
    }

    fn email_error() -> RowError {
        let mut fields = BTreeMap::new();
        fields.insert(
            "email".to_string(),
            vec!["The email field must be a valid email address.".to_string()],
        );
        RowError::validation(fields)
    }

    #[tokio::test]
    async fn test_groups_messages_and_fields() {
        let repo = Arc::new(InMemoryRunRepository::new());
        let run = repo
            .create_run(CreateRunParams::new("contacts", Actor::system()))
            .await
            .unwrap();
        repo.insert_rows(
            run.id,
            &[
                failed(1, Some(email_error())),
                failed(2, Some(RowError::message("Duplicate entry: sku 'A1' already exists"))),
                failed(3, Some(email_error())),
                failed(4, None),
                failed(5, Some(email_error())),
            ],
        )
        .await
        .unwrap();

        let analysis = ErrorAnalyzer::new(repo)
            .with_page_size(2)
            .analyze(run.id, None)
            .await
            .unwrap();

        assert_eq!(analysis.rows_scanned, 5);
        assert_eq!(analysis.skipped, 1);
        assert_eq!(
            analysis.messages,
            vec![
                ErrorCount {
                    key: "The email field must be a valid email address.".to_string(),
                    count: 3
                },
                ErrorCount {
                    key: "Duplicate entry: sku 'A1' already exists".to_string(),
                    count: 1
                },
            ]
        );
        assert_eq!(
            analysis.fields,
            vec![ErrorCount {
                key: "email: The email field must be a valid email address.".to_string(),
                count: 3
            }]
        );
    }

    #[test]
    fn test_fields_without_message_still_count() {
        let mut messages = HashMap::new();
        let mut fields = HashMap::new();

        let counted = tally(
            &json!({ "fields": { "sku": ["The sku field is required."] } }),
            &mut messages,
            &mut fields,
        );

        assert!(counted);
        assert!(messages.is_empty());
        assert_eq!(fields["sku: The sku field is required."], 1);
    }

    #[test]
    fn test_unreadable_payloads_are_not_counted() {
        let mut messages = HashMap::new();
        let mut fields = HashMap::new();

        assert!(!tally(&json!({ "code": 7 }), &mut messages, &mut fields));
        assert!(!tally(&json!({ "fields": { "sku": "required" } }), &mut messages, &mut fields));
        assert!(tally(&json!("Connection reset"), &mut messages, &mut fields));
        assert_eq!(messages["Connection reset"], 1);
        assert!(fields.is_empty());
    }

    #[test]
    fn test_ranking_breaks_ties_by_key_and_limits() {
        let counts = HashMap::from([
            ("b".to_string(), 2),
            ("a".to_string(), 2),
            ("c".to_string(), 5),
        ]);
        let keys: Vec<String> = ranked(counts, Some(2)).into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let analyzer = ErrorAnalyzer::new(Arc::new(InMemoryRunRepository::new()));
        let err = analyzer.analyze(Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, crate::error::IngestError::RunNotFound(_)));
    }
}
