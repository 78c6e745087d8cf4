//! HTTP implementation of [`RemoteStore`] over a PostgREST-style API.

use async_trait::async_trait;
use satchel_engine::{SchemaVersion, CLIENT_ID_FIELD};
use serde::Deserialize;

use super::{AuthExchange, RemoteAuthUser, RemoteError, RemoteRow, RemoteStore, SessionTokens};

/// Remote backend client.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    client_id: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    user: Option<RemoteAuthUser>,
    #[serde(default)]
    session: Option<SessionTokens>,
}

impl HttpRemote {
    /// Create a client for the backend at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http: reqwest::Client::new(),
            base_url,
            api_key: api_key.into(),
            client_id: client_id.into(),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn auth_url(&self, endpoint: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, endpoint)
    }

    fn with_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn row_from_value(value: serde_json::Value, fallback_id: &str) -> RemoteRow {
        let record_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or(fallback_id)
            .to_string();
        let updated_at = value.get("updated_at").and_then(|v| v.as_i64());
        RemoteRow {
            record_id,
            payload: value,
            updated_at,
        }
    }

    async fn exchange(
        &self,
        endpoint: &str,
        username: &str,
        password: &str,
    ) -> Result<AuthExchange, RemoteError> {
        let response = self
            .with_auth(self.http.post(self.auth_url(endpoint)))
            .json(&serde_json::json!({"username": username, "password": password}))
            .send()
            .await?;

        // Auth endpoints report rejection in the body, not the status.
        let body: AuthResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        if !body.success {
            let message = body
                .error
                .or(body.message)
                .unwrap_or_else(|| "authentication failed".to_string());
            return Err(RemoteError::AuthRejected { message });
        }

        match (body.user, body.session) {
            (Some(user), Some(session)) => Ok(AuthExchange { user, session }),
            _ => Err(RemoteError::Decode(
                "auth response missing user or session".to_string(),
            )),
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemote {
    async fn upsert_row(
        &self,
        table: &str,
        record_id: &str,
        payload: &serde_json::Value,
    ) -> Result<RemoteRow, RemoteError> {
        let mut body = payload.clone();
        if let Some(object) = body.as_object_mut() {
            object.insert("id".to_string(), serde_json::json!(record_id));
            object.insert(CLIENT_ID_FIELD.to_string(), serde_json::json!(self.client_id));
        }

        let response = self
            .with_auth(self.http.post(self.table_url(table)))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&serde_json::json!([body]))
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let mut rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        if rows.is_empty() {
            return Err(RemoteError::Decode(
                "upsert returned no representation".to_string(),
            ));
        }
        Ok(Self::row_from_value(rows.remove(0), record_id))
    }

    async fn delete_row(&self, table: &str, record_id: &str) -> Result<(), RemoteError> {
        let response = self
            .with_auth(self.http.delete(self.table_url(table)))
            .query(&[("id", format!("eq.{record_id}"))])
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn fetch_row(
        &self,
        table: &str,
        record_id: &str,
    ) -> Result<Option<RemoteRow>, RemoteError> {
        let response = self
            .with_auth(self.http.get(self.table_url(table)))
            .query(&[("id", format!("eq.{record_id}")), ("limit", "1".into())])
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let mut rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self::row_from_value(rows.remove(0), record_id)))
    }

    async fn changed_since(
        &self,
        table: &str,
        since: Option<i64>,
        site_id: Option<&str>,
    ) -> Result<Vec<RemoteRow>, RemoteError> {
        let mut query: Vec<(String, String)> =
            vec![("order".to_string(), "updated_at.asc".to_string())];
        if let Some(since) = since {
            query.push(("updated_at".to_string(), format!("gt.{since}")));
        }
        if let Some(site_id) = site_id {
            query.push(("site_id".to_string(), format!("eq.{site_id}")));
        }

        let response = self
            .with_auth(self.http.get(self.table_url(table)))
            .query(&query)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|value| Self::row_from_value(value, ""))
            .collect())
    }

    async fn schema_version(&self) -> Result<Option<SchemaVersion>, RemoteError> {
        let response = self
            .with_auth(self.http.get(self.table_url("schema_version")))
            .query(&[("limit", "1")])
            .send()
            .await?;

        // A backend without the versioning table predates the gate.
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;

        let mut rows: Vec<SchemaVersion> = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(rows.remove(0)))
    }

    async fn sign_in(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthExchange, RemoteError> {
        self.exchange("login", username, password).await
    }

    async fn provision_legacy(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthExchange, RemoteError> {
        let exchange = self.exchange("migrate-legacy-user", username, password).await?;
        tracing::info!(username, "legacy account provisioned for token auth");
        Ok(exchange)
    }
}
