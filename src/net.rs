// src/net.rs
//! Transport layer shared by collectors and validators. Every outbound call
//! carries a fixed timeout, and every transport failure (timeout, connection
//! error, non-2xx status, unparseable body) becomes an absent-result
//! sentinel rather than an error: callers treat `None` as "no data from this
//! request" and move on.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT};
use serde_json::Value;
use tracing::error;

use crate::settings::SecretConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/137.0.0.0 Safari/537.36";

pub struct HttpSession {
    client: reqwest::Client,
}

impl HttpSession {
    pub fn new(referer: Option<&str>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_UA));
        if let Some(value) = referer.and_then(|r| HeaderValue::from_str(r).ok()) {
            headers.insert(REFERER, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self { client }
    }

    /// GET returning the parsed JSON body, or `None` on any failure.
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
    ) -> Option<Value> {
        let mut req = self.client.get(url).query(query);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(%url, error = %e, "request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            error!(%url, status = %resp.status(), "request failed");
            return None;
        }
        match resp.json::<Value>().await {
            Ok(body) => Some(body),
            Err(e) => {
                error!(%url, error = %e, "response body was not JSON");
                None
            }
        }
    }

    /// GET that only reports whether the endpoint answered 2xx.
    pub async fn get_ok(&self, url: &str, headers: &[(&str, &str)]) -> bool {
        let mut req = self.client.get(url);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                error!(%url, error = %e, "request failed");
                false
            }
        }
    }

    /// POST with a JSON body, returning the parsed JSON response or `None`.
    pub async fn post_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, &str)],
        body: &Value,
    ) -> Option<Value> {
        let mut req = self.client.post(url).query(query).json(body);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(%url, error = %e, "request failed");
                return None;
            }
        };
        if !resp.status().is_success() {
            error!(%url, status = %resp.status(), "request failed");
            return None;
        }
        match resp.json::<Value>().await {
            Ok(body) => Some(body),
            Err(e) => {
                error!(%url, error = %e, "response body was not JSON");
                None
            }
        }
    }
}

/// Session-token login for the statistics API. Held by any collector that
/// needs a token and invoked explicitly at the start of a run.
pub struct SessionAuthenticator {
    client: reqwest::Client,
    endpoint: String,
    account: String,
    password: String,
    client_id: String,
}

const TOKEN_COOKIE: &str = "_U_T_";

impl SessionAuthenticator {
    pub fn new(secret: &SecretConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client");
        Self {
            client,
            endpoint: secret.one_id_api.clone(),
            account: secret.account.clone(),
            password: secret.password.clone(),
            client_id: secret.client_id.clone(),
        }
    }

    /// Log in and return the session token, or `None` when the login call
    /// fails or yields no token. Callers decide whether that is fatal.
    pub async fn login(&self) -> Option<String> {
        let body = serde_json::json!({
            "permission": "sigRead",
            "account": self.account,
            "client_id": self.client_id,
            "accept_term": 0,
            "password": self.password,
        });
        let resp = match self.client.post(&self.endpoint).json(&body).send().await {
            Ok(resp) => resp,
            Err(e) => {
                error!(error = %e, "login request failed");
                return None;
            }
        };
        let token = resp
            .cookies()
            .find(|c| c.name() == TOKEN_COOKIE)
            .map(|c| c.value().to_string());
        match token {
            Some(token) if !token.is_empty() => Some(token),
            _ => {
                error!("login response carried no session token");
                None
            }
        }
    }
}
