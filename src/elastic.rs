//! Elasticsearch implementation of [`IndexBackend`].
//!
//! Two endpoints are used:
//!
//! - `POST /_bulk?refresh=true` with an NDJSON body of `index` actions;
//!   per-item failures are read from the response `items` array.
//! - `POST /{index}/_update_by_query?conflicts=proceed&refresh=true` with a
//!   painless script clearing `is_latest` on a `terms` query over
//!   `group_id`.
//!
//! Authentication is either an API key (`Authorization: ApiKey …`) or HTTP
//! basic credentials. Retrying is left to the caller; this module only
//! classifies failures.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use case_index_core::backend::{BackendError, BulkItem, BulkOutcome, IndexBackend};

use crate::config::BackendConfig;

/// How many per-item error reasons a [`BulkOutcome`] keeps.
const MAX_REPORTED_ERRORS: usize = 5;

#[derive(Debug, Clone)]
enum Auth {
    None,
    ApiKey(String),
    Basic { username: String, password: String },
}

pub struct ElasticBackend {
    client: reqwest::Client,
    base_url: String,
    auth: Auth,
}

impl ElasticBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_secs));
        if config.insecure && config.url.starts_with("https://") {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build()?;

        // Basic credentials take precedence over an API key.
        let auth = match (&config.username, &config.password, config.resolved_api_key()) {
            (Some(username), Some(password), _) => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            (_, _, Some(key)) => Auth::ApiKey(key),
            _ => Auth::None,
        };

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let req = self.client.post(format!("{}{}", self.base_url, path));
        match &self.auth {
            Auth::None => req,
            Auth::ApiKey(key) => req.header("Authorization", format!("ApiKey {}", key)),
            Auth::Basic { username, password } => req.basic_auth(username, Some(password)),
        }
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout(e.to_string())
    } else {
        BackendError::Transport(e.to_string())
    }
}

/// NDJSON body for `_bulk`: an `index` action line then the document line.
pub fn bulk_body(index: &str, items: &[BulkItem]) -> String {
    let mut body = String::new();
    for item in items {
        let action = json!({ "index": { "_index": index, "_id": item.id } });
        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&item.body.to_string());
        body.push('\n');
    }
    body
}

/// Count successes and rejections in a `_bulk` response.
pub fn parse_bulk_response(resp: &Value) -> Result<BulkOutcome, BackendError> {
    let items = resp
        .get("items")
        .and_then(Value::as_array)
        .ok_or_else(|| BackendError::InvalidResponse("missing items array".to_string()))?;

    let mut outcome = BulkOutcome::default();
    for item in items {
        let result = item
            .as_object()
            .and_then(|o| o.values().next())
            .ok_or_else(|| BackendError::InvalidResponse("malformed bulk item".to_string()))?;
        let status = result.get("status").and_then(Value::as_u64).unwrap_or(0);
        if (200..300).contains(&status) && result.get("error").is_none() {
            outcome.indexed += 1;
            continue;
        }
        outcome.rejected += 1;
        if outcome.errors.len() < MAX_REPORTED_ERRORS {
            let id = result.get("_id").and_then(Value::as_str).unwrap_or("?");
            let reason = result
                .pointer("/error/reason")
                .or_else(|| result.pointer("/error/type"))
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            outcome.errors.push(format!("{} ({}): {}", id, status, reason));
        }
    }
    Ok(outcome)
}

pub fn clear_latest_body(group_ids: &[String]) -> Value {
    json!({
        "script": { "source": "ctx._source.is_latest = false", "lang": "painless" },
        "query": { "terms": { "group_id": group_ids } }
    })
}

#[async_trait]
impl IndexBackend for ElasticBackend {
    async fn bulk_index(
        &self,
        index: &str,
        items: &[BulkItem],
    ) -> Result<BulkOutcome, BackendError> {
        if items.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let resp = self
            .post("/_bulk?refresh=true")
            .header("Content-Type", "application/x-ndjson")
            .body(bulk_body(index, items))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), body_text));
        }
        let json: Value = resp.json().await.map_err(transport_error)?;
        parse_bulk_response(&json)
    }

    async fn clear_latest(&self, index: &str, group_ids: &[String]) -> Result<(), BackendError> {
        if group_ids.is_empty() {
            return Ok(());
        }
        let resp = self
            .post(&format!(
                "/{}/_update_by_query?conflicts=proceed&refresh=true",
                index
            ))
            .json(&clear_latest_body(group_ids))
            .send()
            .await
            .map_err(transport_error)?;

        let status = resp.status();
        match status.as_u16() {
            s if (200..300).contains(&s) => Ok(()),
            409 => {
                tracing::debug!(index, groups = group_ids.len(), "clear_latest version conflicts ignored");
                Ok(())
            }
            404 => {
                tracing::debug!(index, "index does not exist yet, nothing to clear");
                Ok(())
            }
            s => {
                let body_text = resp.text().await.unwrap_or_default();
                Err(BackendError::from_status(s, body_text))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_body_is_ndjson_pairs() {
        let items = vec![
            BulkItem { id: "g::1".into(), body: json!({"a": 1}) },
            BulkItem { id: "g::2".into(), body: json!({"a": 2}) },
        ];
        let body = bulk_body("cases", &items);
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(body.ends_with('\n'));
        let action: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(action, json!({"index": {"_index": "cases", "_id": "g::2"}}));
        assert_eq!(lines[3], r#"{"a":2}"#);
    }

    #[test]
    fn bulk_response_counts_rejections() {
        let resp = json!({
            "errors": true,
            "items": [
                {"index": {"_id": "g::1", "status": 201}},
                {"index": {"_id": "g::2", "status": 400,
                    "error": {"type": "mapper_parsing_exception", "reason": "failed to parse field [date_reg]"}}},
                {"index": {"_id": "g::3", "status": 200}}
            ]
        });
        let out = parse_bulk_response(&resp).unwrap();
        assert_eq!(out.indexed, 2);
        assert_eq!(out.rejected, 1);
        assert_eq!(out.errors, vec!["g::2 (400): failed to parse field [date_reg]".to_string()]);
    }

    #[test]
    fn bulk_response_without_items_is_invalid() {
        let err = parse_bulk_response(&json!({"took": 3})).unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[test]
    fn clear_latest_body_shape() {
        let body = clear_latest_body(&["a".to_string(), "b".to_string()]);
        assert_eq!(body["query"]["terms"]["group_id"], json!(["a", "b"]));
        assert_eq!(body["script"]["source"], json!("ctx._source.is_latest = false"));
    }

    #[test]
    fn auth_selection() {
        let mut cfg = crate::config::BackendConfig {
            url: "https://es.local:9200/".into(),
            index: "cases".into(),
            api_key: Some("k".into()),
            username: None,
            password: None,
            insecure: true,
            timeout_secs: 5,
        };
        let b = ElasticBackend::new(&cfg).unwrap();
        assert!(matches!(b.auth, Auth::ApiKey(ref k) if k == "k"));
        assert_eq!(b.base_url, "https://es.local:9200");

        cfg.username = Some("elastic".into());
        cfg.password = Some("secret".into());
        let b = ElasticBackend::new(&cfg).unwrap();
        assert!(matches!(b.auth, Auth::Basic { .. }));
    }
}
