//! Table access through the PostgREST API

use reqwest::Client;
use serde_json::Value;

use super::{BackendError, Query};
use crate::fetch::Fetch;

pub(crate) struct RestApi {
    url: String,
    key: String,
    client: Client,
}

impl RestApi {
    pub(crate) fn new(url: &str, key: &str, client: Client) -> Self {
        Self {
            url: url.to_string(),
            key: key.to_string(),
            client,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.url, table)
    }

    /// `GET /rest/v1/{table}?select=*&order=...&col=op.value`
    pub(crate) async fn select(&self, query: &Query, token: &str) -> Result<Vec<Value>, BackendError> {
        let url = self.table_url(&query.collection);
        let mut request = Fetch::get(&self.client, &url)
            .header("apikey", &self.key)
            .bearer_auth(token)
            .query("select", "*");

        for filter in &query.filters {
            request = request.query(
                &filter.column,
                &format!("{}.{}", filter.operator, filter.value),
            );
        }

        if let Some(order) = &query.order {
            let direction = if order.ascending { "asc" } else { "desc" };
            request = request.query("order", &format!("{}.{}", order.column, direction));
        }

        request.execute::<Vec<Value>>().await
    }

    /// `POST /rest/v1/{table}` without asking for the row back
    pub(crate) async fn insert(
        &self,
        table: &str,
        record: &Value,
        token: &str,
    ) -> Result<(), BackendError> {
        let url = self.table_url(table);
        Fetch::post(&self.client, &url)
            .header("apikey", &self.key)
            .header("Prefer", "return=minimal")
            .bearer_auth(token)
            .json(record)?
            .execute_empty()
            .await
    }
}
