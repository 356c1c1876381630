//! HTTP hook: one GET against a registered source connection.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use stagehouse_core::connection::{Connection, HttpAuth};
use stagehouse_core::error::StageError;

/// Default request timeout; dataset dumps are large, so this is generous.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(900);

/// Shared HTTP client for source fetches.
///
/// Cloning is cheap; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct HttpHook {
    client: reqwest::Client,
}

impl HttpHook {
    pub fn new(timeout: Duration) -> Result<Self, StageError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("stagehouse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StageError::invalid(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// `{base_url}/{endpoint}?{params}` for `conn`.
    pub fn endpoint_url(
        conn: &Connection,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Url, StageError> {
        let base = conn.base_url()?;
        let raw = format!("{base}/{}", endpoint.trim_start_matches('/'));
        let mut url = Url::parse(&raw)
            .map_err(|e| StageError::unresolved(&conn.conn_id, format!("invalid URL {raw}: {e}")))?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        Ok(url)
    }

    /// GET the endpoint and return the body unchanged.
    ///
    /// Non-2xx responses become [`StageError::Transfer`] with a bounded body
    /// excerpt. Requests that never produce a response are reported the same
    /// way with status 0, so they are retried like any other transfer failure.
    pub async fn get(
        &self,
        conn: &Connection,
        endpoint: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Bytes, StageError> {
        let url = Self::endpoint_url(conn, endpoint, params)?;
        let mut request = self.client.get(url.clone());
        request = match conn.http_auth() {
            HttpAuth::None => request,
            HttpAuth::Basic { login, password } => request.basic_auth(login, password),
            HttpAuth::Bearer(token) => request.bearer_auth(token),
        };

        debug!(url = %url, conn_id = %conn.conn_id, "HTTP GET");
        let response = request.send().await.map_err(|e| no_response(&url, &e))?;
        let status = response.status();
        let body = response.bytes().await.map_err(|e| no_response(&url, &e))?;
        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "HTTP response");

        if !status.is_success() {
            return Err(StageError::transfer(url.as_str(), status.as_u16(), &body));
        }
        Ok(body)
    }
}

fn no_response(url: &Url, err: &reqwest::Error) -> StageError {
    StageError::transfer(url.as_str(), 0, err.to_string().as_bytes())
}
