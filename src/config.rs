use lazy_static::lazy_static;

/// Cached lookups older than this are never served
pub const CACHE_TTL_HOURS: i64 = 4;
/// Maximum number of lookups kept in the history
pub const HISTORY_CAPACITY: usize = 20;

pub const HISTORY_STORAGE_KEY: &str = "infomap_history";
pub const SESSION_STORAGE_KEY: &str = "infomap_session";
/// Name of the backend's session cookie
pub const SESSION_COOKIE: &str = "session";

/// Quota shown until the backend reports the real one
pub const DEFAULT_MAX_QUOTA: u32 = 5;

const DEFAULT_GEOJSON_URL: &str =
    "https://raw.githubusercontent.com/vasturiano/react-globe.gl/master/example/datasets/ne_110m_admin_0_countries.geojson";

pub struct AppConfig {
    pub api_base: String,
    pub geojson_url: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let api_url = std::env::var("INFOMAP_API_URL").ok();
        let host = std::env::var("INFOMAP_HOST").unwrap_or_else(|_| "localhost".to_string());

        Self {
            api_base: resolve_api_base(api_url.as_deref(), &host),
            geojson_url: std::env::var("INFOMAP_GEOJSON_URL")
                .unwrap_or_else(|_| DEFAULT_GEOJSON_URL.to_string()),
        }
    }
}

lazy_static! {
    pub static ref CONFIG: AppConfig = AppConfig::from_env();
}

/// An explicit URL always wins. Otherwise the backend is assumed to run next
/// to `host`: locally on port 8000, behind `/api` on the public deployment.
pub fn resolve_api_base(explicit: Option<&str>, host: &str) -> String {
    if let Some(url) = explicit.map(str::trim).filter(|u| !u.is_empty()) {
        return url.trim_end_matches('/').to_string();
    }

    match host {
        "" | "localhost" => "http://localhost:8000".to_string(),
        "infomap.ovh" => "https://infomap.ovh/api".to_string(),
        other => format!("http://{}:8000", other),
    }
}
