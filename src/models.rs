use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time window of a news lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeFilter {
    #[default]
    #[serde(rename = "24h")]
    Last24Hours,
    #[serde(rename = "7d")]
    Last7Days,
}

impl TimeFilter {
    pub const ALL: [TimeFilter; 2] = [TimeFilter::Last24Hours, TimeFilter::Last7Days];

    /// Value used on the wire and in the history log
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeFilter::Last24Hours => "24h",
            TimeFilter::Last7Days => "7d",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TimeFilter::Last24Hours => "24H",
            TimeFilter::Last7Days => "7D",
        }
    }
}

/// Topic of a news lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Topic {
    #[default]
    General,
    Economy,
    Politics,
    Tech,
    Military,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::General,
        Topic::Economy,
        Topic::Politics,
        Topic::Tech,
        Topic::Military,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::General => "General",
            Topic::Economy => "Economy",
            Topic::Politics => "Politics",
            Topic::Tech => "Tech",
            Topic::Military => "Military",
        }
    }

    // Button labels differ from the wire values for two topics
    pub fn label(&self) -> &'static str {
        match self {
            Topic::General => "General",
            Topic::Economy => "Finance",
            Topic::Politics => "Politics",
            Topic::Tech => "Tech",
            Topic::Military => "Military/Geo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsItem {
    #[serde(rename = "titre")]
    pub headline: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub source_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryStats {
    #[serde(default)]
    pub population: u64,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub subregion: String,
    #[serde(default)]
    pub capital: String,
    #[serde(default)]
    pub flag_emoji: String,
}

impl CountryStats {
    /// Population in millions with one decimal, e.g. "67.8M"
    pub fn population_millions(&self) -> String {
        format!("{:.1}M", self.population as f64 / 1_000_000.0)
    }
}

/// Identifies "the same lookup" in the history cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub country: String,
    pub time_filter: TimeFilter,
    pub topic: Topic,
}

impl LookupKey {
    pub fn new(country: impl Into<String>, time_filter: TimeFilter, topic: Topic) -> Self {
        Self {
            country: country.into(),
            time_filter,
            topic,
        }
    }
}

/// One cached result of a country/topic/time-filter query.
///
/// The serialized shape is shared with the backend's `/history` endpoint, so
/// local and server records go through the same decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupRecord {
    pub country: String,
    pub time_filter: TimeFilter,
    pub topic: Topic,
    #[serde(rename = "news", default)]
    pub news_items: Vec<NewsItem>,
    #[serde(rename = "stats", default)]
    pub country_stats: Option<CountryStats>,
    #[serde(rename = "timestamp", with = "timestamp")]
    pub captured_at: DateTime<Utc>,
}

impl LookupRecord {
    pub fn key(&self) -> LookupKey {
        LookupKey::new(self.country.clone(), self.time_filter, self.topic)
    }

    pub fn matches(&self, key: &LookupKey) -> bool {
        self.country == key.country
            && self.time_filter == key.time_filter
            && self.topic == key.topic
    }
}

/// Timestamps are written as RFC 3339. The backend emits naive ISO-8601
/// strings (no offset), which are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &DateTime<Utc>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(|naive| naive.and_utc())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Quota {
    pub count: u32,
    pub max: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsResponse {
    #[serde(default)]
    pub news: Vec<NewsItem>,
    #[serde(default)]
    pub stats: Option<CountryStats>,
    #[serde(default)]
    pub quota: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserProfile {
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[allow(dead_code)]
    #[serde(default)]
    pub picture: String,
}

/// Answer of `GET /me`.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AuthStatus {
    #[serde(default)]
    pub authenticated: bool,
    #[serde(default)]
    pub user: Option<UserProfile>,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AdminUser {
    #[allow(dead_code)]
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    #[serde(default)]
    pub is_active: bool,
    pub max_daily_quota: u32,
    #[serde(default)]
    pub today_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewUserRequest {
    pub email: String,
    pub is_admin: bool,
    pub max_daily_quota: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaUpdate {
    pub email: String,
    pub max_daily_quota: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusUpdate {
    pub email: String,
    pub is_active: bool,
}
