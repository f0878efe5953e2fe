use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::config::SESSION_COOKIE;
use crate::models::{
    AdminUser, AuthStatus, LookupKey, LookupRecord, NewUserRequest, NewsResponse, Quota,
    QuotaUpdate, StatusUpdate,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Backend unreachable: {0}")]
    Network(#[from] reqwest::Error),
    #[error("Not authenticated")]
    Unauthorized,
    #[error("{detail}")]
    Rejected { status: u16, detail: String },
    #[error("Unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// The request never got an answer from the backend
    pub fn is_unreachable(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Blocking client for the InfoMap backend.
///
/// Clones share the HTTP connection pool and the session, so a login made
/// through one handle is seen by the copies held by worker threads.
#[derive(Clone)]
pub struct InfomapClient {
    client: Client,
    base_url: String,
    session: Arc<RwLock<Option<String>>>,
}

impl InfomapClient {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        // Redirects point at the identity provider, which a JSON client cannot follow
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .user_agent(concat!("infomap-desktop/", env!("CARGO_PKG_VERSION")))
            .redirect(Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session: Arc::new(RwLock::new(None)),
        })
    }

    pub fn set_session(&self, session: Option<String>) {
        if let Ok(mut guard) = self.session.write() {
            *guard = session.filter(|s| !s.trim().is_empty());
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.read().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Page that starts the identity provider flow, opened in a browser
    pub fn login_url(&self) -> String {
        format!("{}/login", self.base_url)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match self.session.read().ok().and_then(|s| s.clone()) {
            Some(session) => builder.header(
                reqwest::header::COOKIE,
                format!("{}={}", SESSION_COOKIE, session),
            ),
            None => builder,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    /// Passes successful responses through and turns the rest into errors
    fn check(response: Response) -> ApiResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ApiError::Unauthorized);
        }

        let body = response.text().unwrap_or_default();
        Err(ApiError::Rejected {
            status: status.as_u16(),
            detail: error_detail(status.as_u16(), &body),
        })
    }

    fn decode<T: DeserializeOwned>(response: Response) -> ApiResult<T> {
        let body = response.text()?;
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }

    pub fn fetch_me(&self) -> ApiResult<AuthStatus> {
        let response = self.get("/me").send()?;
        match Self::check(response) {
            Ok(response) => Self::decode(response),
            Err(ApiError::Unauthorized) => Ok(AuthStatus::default()),
            Err(e) => Err(e),
        }
    }

    /// Ends the backend session. The redirect it answers with is not followed.
    pub fn logout(&self) -> ApiResult<()> {
        let response = self.get("/logout").send()?;
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            Ok(())
        } else {
            Self::check(response).map(|_| ())
        }
    }

    /// `None` when the backend does not know who we are.
    pub fn fetch_quota(&self) -> ApiResult<Option<Quota>> {
        let response = self.get("/quota").send()?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ApiError::Rejected {
                status: response.status().as_u16(),
                detail: format!("Backend unreachable (Status: {})", response.status().as_u16()),
            });
        }

        Self::decode(response).map(Some)
    }

    /// Server-side copy of the lookup history. A refusal yields an empty list.
    pub fn fetch_history(&self) -> ApiResult<Vec<LookupRecord>> {
        let response = self.get("/history").send()?;
        if !response.status().is_success() {
            log::info!("History unavailable on server (status {})", response.status());
            return Ok(Vec::new());
        }

        let entries: Vec<serde_json::Value> = Self::decode(response)?;
        Ok(decode_history(entries))
    }

    pub fn fetch_news(&self, key: &LookupKey) -> ApiResult<NewsResponse> {
        let response = self.get(&news_path(key)).send()?;
        let status = response.status();
        if !status.is_success() {
            // The news endpoint explains refusals (quota, auth) in `detail`
            let body = response.text().unwrap_or_default();
            return Err(ApiError::Rejected {
                status: status.as_u16(),
                detail: error_detail(status.as_u16(), &body),
            });
        }

        Self::decode(response)
    }

    /// Fetches a document from outside the API, such as the country boundaries
    pub fn fetch_text(&self, url: &str) -> ApiResult<String> {
        let response = Self::check(self.client.get(url).send()?)?;
        Ok(response.text()?)
    }

    pub fn admin_list_users(&self) -> ApiResult<Vec<AdminUser>> {
        let response = Self::check(self.get("/admin/users").send()?)?;
        Self::decode(response)
    }

    pub fn admin_add_user(&self, request: &NewUserRequest) -> ApiResult<()> {
        let response = self.request(reqwest::Method::POST, "/admin/users").json(request).send()?;
        Self::check(response).map(|_| ())
    }

    pub fn admin_update_quota(&self, update: &QuotaUpdate) -> ApiResult<()> {
        let response = self.request(reqwest::Method::POST, "/admin/quota").json(update).send()?;
        Self::check(response).map(|_| ())
    }

    pub fn admin_set_status(&self, update: &StatusUpdate) -> ApiResult<()> {
        let response = self
            .request(reqwest::Method::PATCH, "/admin/user/status")
            .json(update)
            .send()?;
        Self::check(response).map(|_| ())
    }

    pub fn admin_delete_user(&self, email: &str) -> ApiResult<()> {
        let path = format!("/admin/user/{}", urlencoding::encode(email));
        let response = self.request(reqwest::Method::DELETE, &path).send()?;
        Self::check(response).map(|_| ())
    }
}

fn news_path(key: &LookupKey) -> String {
    format!(
        "/news/{}?time_filter={}&topic={}",
        urlencoding::encode(&key.country),
        key.time_filter.as_str(),
        key.topic.as_str()
    )
}

/// Message for a refused request: the backend's `detail` when it sent one
fn error_detail(status: u16, body: &str) -> String {
    let detail = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").cloned());

    match detail {
        Some(serde_json::Value::String(message)) if !message.is_empty() => message,
        Some(serde_json::Value::Null) | None => format!("Server error: {}", status),
        Some(other) => other.to_string(),
    }
}

/// Decodes history entries one by one so a single malformed entry does not
/// discard the rest.
fn decode_history(entries: Vec<serde_json::Value>) -> Vec<LookupRecord> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<LookupRecord>(entry) {
            Ok(record) => Some(record),
            Err(e) => {
                log::warn!("Skipping malformed history entry: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TimeFilter, Topic};
    use serde_json::json;

    #[test]
    fn test_news_path_encodes_country() {
        let key = LookupKey::new("Côte d'Ivoire", TimeFilter::Last7Days, Topic::Military);
        assert_eq!(
            news_path(&key),
            "/news/C%C3%B4te%20d%27Ivoire?time_filter=7d&topic=Military"
        );
    }

    #[test]
    fn test_error_detail() {
        assert_eq!(
            error_detail(429, r#"{"detail": "Daily quota exceeded"}"#),
            "Daily quota exceeded"
        );
        assert_eq!(error_detail(502, "<html>Bad gateway</html>"), "Server error: 502");
        assert_eq!(error_detail(500, r#"{"detail": null}"#), "Server error: 500");
        assert_eq!(
            error_detail(422, r#"{"detail": [{"msg": "field required"}]}"#),
            r#"[{"msg":"field required"}]"#
        );
    }

    #[test]
    fn test_decode_history_skips_malformed_entries() {
        let entries = vec![
            json!({
                "country": "Peru", "time_filter": "24h", "topic": "Politics",
                "news": [], "stats": null, "timestamp": "2024-05-02T09:00:00"
            }),
            json!({"country": "Nowhere", "topic": "Weather"}),
        ];

        let records = decode_history(entries);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].country, "Peru");
    }

    #[test]
    fn test_auth_check_reports_unreachable_backend() {
        let client = InfomapClient::new("not a url").unwrap();
        client.set_session(Some("token".to_string()));

        let err = client.fetch_me().unwrap_err();
        assert!(err.is_unreachable());
        assert!(!ApiError::Unauthorized.is_unreachable());
    }

    #[test]
    fn test_session_is_shared_between_clones() {
        let client = InfomapClient::new("http://localhost:8000/").unwrap();
        let worker_copy = client.clone();
        assert!(!worker_copy.has_session());

        client.set_session(Some("token".to_string()));
        assert!(worker_copy.has_session());

        client.set_session(Some("   ".to_string()));
        assert!(!worker_copy.has_session());
        assert_eq!(client.login_url(), "http://localhost:8000/login");
    }
}
