//! Status checking shared by the administrative managers.

use evstore_core::http::{HttpClient, HttpResponse};
use evstore_core::{EndPoint, UserCredentials};
use http::{Method, StatusCode};
use tracing::debug;

use crate::error::{AdminError, AdminResult};

#[derive(Debug, Clone)]
pub(crate) struct AdminHttp {
    endpoint: EndPoint,
    client: HttpClient,
    default_credentials: Option<UserCredentials>,
}

impl AdminHttp {
    pub(crate) fn new(endpoint: EndPoint, client: HttpClient) -> Self {
        Self {
            endpoint,
            client,
            default_credentials: None,
        }
    }

    pub(crate) fn set_default_credentials(&mut self, credentials: UserCredentials) {
        self.default_credentials = Some(credentials);
    }

    pub(crate) fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.client.scheme(), self.endpoint, path)
    }

    /// GET `path` and return the non-empty body.
    pub(crate) async fn get(&self, path: &str, credentials: Option<&UserCredentials>) -> AdminResult<String> {
        let resp = self.send(Method::GET, path, credentials, None, StatusCode::OK).await?;
        let body = resp.text();
        if body.is_empty() {
            return Err(AdminError::EmptyBody { url: self.url(path) });
        }
        Ok(body)
    }

    pub(crate) async fn post(
        &self,
        path: &str,
        body: &str,
        credentials: Option<&UserCredentials>,
        expected: StatusCode,
    ) -> AdminResult<()> {
        self.send(Method::POST, path, credentials, Some(body.to_string()), expected)
            .await
            .map(drop)
    }

    pub(crate) async fn put(
        &self,
        path: &str,
        body: &str,
        credentials: Option<&UserCredentials>,
    ) -> AdminResult<()> {
        self.send(Method::PUT, path, credentials, Some(body.to_string()), StatusCode::OK)
            .await
            .map(drop)
    }

    pub(crate) async fn delete(&self, path: &str, credentials: Option<&UserCredentials>) -> AdminResult<()> {
        self.send(Method::DELETE, path, credentials, None, StatusCode::OK)
            .await
            .map(drop)
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        credentials: Option<&UserCredentials>,
        body: Option<String>,
        expected: StatusCode,
    ) -> AdminResult<HttpResponse> {
        let credentials = credentials.or(self.default_credentials.as_ref());
        let resp = self
            .client
            .request(method.clone(), &self.endpoint, path, credentials, body)
            .await?;

        if resp.status == expected {
            return Ok(resp);
        }
        debug!(%method, %path, status = %resp.status, "admin request rejected");
        if method == Method::POST && resp.status == StatusCode::CONFLICT {
            return Err(AdminError::Conflict {
                status: resp.status,
                reason: resp.reason,
            });
        }
        Err(AdminError::CommandFailed {
            status: resp.status,
            message: format!(
                "Server returned {} ({}) for {} on {}",
                resp.status.as_u16(),
                resp.reason,
                method,
                self.url(path)
            ),
        })
    }
}

/// Percent-encode a query parameter value.
pub(crate) fn encode_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(byte as char),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_percent_encoded() {
        assert_eq!(encode_query_value("orders-by_day.v2"), "orders-by_day.v2");
        assert_eq!(encode_query_value("my projection&x=1"), "my%20projection%26x%3D1");
        assert_eq!(encode_query_value("é"), "%C3%A9");
    }

    #[test]
    fn url_uses_client_scheme() {
        let http = AdminHttp::new(
            EndPoint::new("db.local", 2113),
            HttpClient::plain(std::time::Duration::from_secs(1)),
        );
        assert_eq!(http.url("/projections/any"), "http://db.local:2113/projections/any");
    }
}
