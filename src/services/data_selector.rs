use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Turns a data selector into the ids of the items it selects.
#[async_trait::async_trait]
pub trait DataSelectorResolver: Send + Sync {
    async fn resolve(&self, data_selector_id: u64) -> Result<Vec<u64>>;
}

/// Resolves data selectors through the platform's HTTP API.
#[derive(Clone)]
pub struct HttpDataSelectorResolver {
    base_url: String,
    access_token: Option<String>,
    client: reqwest::Client,
}

impl HttpDataSelectorResolver {
    pub fn new(base_url: impl Into<String>, access_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            access_token,
            client,
        }
    }

    fn result_url(&self, data_selector_id: u64) -> String {
        format!(
            "{}/api/v3/data-selectors/{}/result",
            self.base_url.trim_end_matches('/'),
            data_selector_id
        )
    }
}

/// Used when no data selector API is configured.
#[derive(Debug, Clone, Default)]
pub struct NoDataSelectors;

#[async_trait::async_trait]
impl DataSelectorResolver for NoDataSelectors {
    async fn resolve(&self, data_selector_id: u64) -> Result<Vec<u64>> {
        Err(anyhow!(
            "Data selector {} cannot be resolved: no data selector API is configured",
            data_selector_id
        ))
    }
}

/// Pull ids out of a `[{"id": …}, …]` result. Ids may be numbers or numeric strings.
pub fn ids_from_result(result: &Value) -> Result<Vec<u64>> {
    let rows = result
        .as_array()
        .ok_or_else(|| anyhow!("Data selector result is not an array"))?;

    Ok(rows
        .iter()
        .filter_map(|row| row.get("id"))
        .filter_map(|id| match id {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
        .collect())
}

#[async_trait::async_trait]
impl DataSelectorResolver for HttpDataSelectorResolver {
    async fn resolve(&self, data_selector_id: u64) -> Result<Vec<u64>> {
        let mut request = self.client.get(self.result_url(data_selector_id));
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Data selector {} request failed", data_selector_id))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "Data selector {} returned {}: {}",
                data_selector_id,
                status,
                body
            ));
        }

        let result: Value = response
            .json()
            .await
            .with_context(|| format!("Invalid response from data selector {}", data_selector_id))?;
        ids_from_result(&result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_from_result() {
        let result = json!([{"id": 4}, {"id": "7"}, {"name": "no id"}, {"id": null}]);
        assert_eq!(ids_from_result(&result).unwrap(), vec![4, 7]);
        assert!(ids_from_result(&json!({"id": 1})).is_err());
    }

    #[test]
    fn test_result_url() {
        let resolver = HttpDataSelectorResolver::new("https://tenant.example.com/", None);
        assert_eq!(
            resolver.result_url(12),
            "https://tenant.example.com/api/v3/data-selectors/12/result"
        );
    }
}
