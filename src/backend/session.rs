//! Shared HTTP session for backend implementations.
//! The client is built on first use and dropped once on close.

use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use super::TransportError;

pub struct HttpSession {
    base_url: String,
    api_key: Option<String>,
    proxy: Option<String>,
    client: Mutex<Option<reqwest::Client>>,
    closed: Mutex<bool>,
}

impl HttpSession {
    pub fn new(base_url: &str, api_key: Option<String>, proxy: Option<String>) -> Result<Self, TransportError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(TransportError::InvalidUrl(base_url));
        }
        Ok(Self {
            base_url,
            api_key: api_key.filter(|k| !k.is_empty()),
            proxy: proxy.filter(|p| !p.is_empty()),
            client: Mutex::new(None),
            closed: Mutex::new(false),
        })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Cheap clone of the pooled client, building it on first call.
    pub fn client(&self) -> Result<reqwest::Client, TransportError> {
        if *self.closed.lock() {
            return Err(TransportError::Closed);
        }
        let mut slot = self.client.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(4)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10));
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        let client = builder.build()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Request builder with bearer auth applied when a key is configured.
    pub fn request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut req = self.client()?.request(method, self.url(path));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        Ok(req)
    }

    /// Send, require 200, decode a JSON body.
    pub async fn json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let mut req = self.request(method, path)?;
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        expect_json(resp).await
    }

    /// Drop the client. Returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        self.client.lock().take();
        true
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

/// Map a non-200 response to [`TransportError::Status`], else decode JSON.
pub async fn expect_json(resp: reqwest::Response) -> Result<Value, TransportError> {
    let status = resp.status();
    if status != reqwest::StatusCode::OK {
        let body = resp.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body: body.chars().take(200).collect(),
        });
    }
    Ok(resp.json::<Value>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_http_urls() {
        assert!(matches!(
            HttpSession::new("127.0.0.1:5000", None, None),
            Err(TransportError::InvalidUrl(_))
        ));
    }

    #[test]
    fn close_happens_once() {
        let session = HttpSession::new("http://127.0.0.1:5000/", Some(String::new()), None).unwrap();
        assert_eq!(session.url("/v1/models"), "http://127.0.0.1:5000/v1/models");
        assert!(session.client().is_ok());
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert!(matches!(session.client(), Err(TransportError::Closed)));
    }
}
