use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::config::{CACHE_TTL_HOURS, HISTORY_CAPACITY, HISTORY_STORAGE_KEY};
use crate::db::LocalStore;
use crate::models::{CountryStats, LookupKey, LookupRecord, NewsItem};

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Bounded, time-limited log of past lookups, most recent first.
///
/// Answers "do we already have a fresh result for this query" before a news
/// request goes out. Every mutation is mirrored to the local store under
/// [`HISTORY_STORAGE_KEY`]; a store that fails to write is logged and
/// otherwise ignored.
///
/// Records sharing a [`LookupKey`] are not deduplicated on insert. Only the
/// first match in collection order is consulted by [`HistoryCache::try_get`],
/// older duplicates stay visible until they expire or fall off the end.
pub struct HistoryCache {
    records: Vec<LookupRecord>,
    store: Option<LocalStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    capacity: usize,
}

impl HistoryCache {
    /// An empty cache. Nothing is read from `store` until a mutation writes to it.
    pub fn new(store: Option<LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Vec::new(),
            store,
            clock,
            ttl: Duration::hours(CACHE_TTL_HOURS),
            capacity: HISTORY_CAPACITY,
        }
    }

    /// Rehydrates the cache from the local store. Missing or corrupt data
    /// yields an empty cache.
    pub fn load(store: LocalStore, clock: Arc<dyn Clock>) -> Self {
        let records = match store.get_item(HISTORY_STORAGE_KEY) {
            Ok(Some(saved)) => match serde_json::from_str::<Vec<LookupRecord>>(&saved) {
                Ok(records) => records,
                Err(e) => {
                    log::warn!("Discarding unreadable history from local storage: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("Failed to read history from local storage: {}", e);
                Vec::new()
            }
        };

        let mut cache = Self::new(Some(store), clock);
        cache.records = records;
        cache
    }

    fn is_fresh(&self, record: &LookupRecord, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(record.captured_at) < self.ttl
    }

    /// Returns the most recent record for `key` if it is still fresh. An
    /// expired match is dropped from the collection.
    pub fn try_get(&mut self, key: &LookupKey) -> Option<LookupRecord> {
        let index = self.records.iter().position(|r| r.matches(key))?;
        let now = self.clock.now();

        if self.is_fresh(&self.records[index], now) {
            return Some(self.records[index].clone());
        }

        let expired = self.records.remove(index);
        log::debug!(
            "Dropped expired lookup {} / {} / {} captured at {}",
            expired.country,
            expired.time_filter.as_str(),
            expired.topic.as_str(),
            expired.captured_at
        );
        self.persist();
        None
    }

    /// Inserts a fresh record at the front and returns it.
    pub fn record(
        &mut self,
        key: LookupKey,
        news_items: Vec<NewsItem>,
        country_stats: Option<CountryStats>,
    ) -> &LookupRecord {
        let record = LookupRecord {
            country: key.country,
            time_filter: key.time_filter,
            topic: key.topic,
            news_items,
            country_stats,
            captured_at: self.clock.now(),
        };

        self.records.insert(0, record);
        self.records.truncate(self.capacity);
        self.persist();
        &self.records[0]
    }

    /// Folds the backend's copy of the history into the local one. Server
    /// records win for any key they cover; local records for other keys are
    /// kept. The result is ordered by capture time, newest first, and capped.
    pub fn merge_server_history(&mut self, server_records: Vec<LookupRecord>) {
        if server_records.is_empty() {
            return;
        }

        let mut merged = server_records;
        let server_len = merged.len();
        let local = std::mem::take(&mut self.records);
        for local_record in local {
            let key = local_record.key();
            if !merged[..server_len].iter().any(|r| r.matches(&key)) {
                merged.push(local_record);
            }
        }

        // Stable sort keeps server records ahead of local ones on equal timestamps
        merged.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));
        merged.truncate(self.capacity);

        log::info!("Merged server history, {} records cached", merged.len());
        self.records = merged;
        self.persist();
    }

    /// Removes every record older than the TTL and returns how many went.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let before = self.records.len();
        self.records
            .retain(|r| now.signed_duration_since(r.captured_at) < ttl);
        let removed = before - self.records.len();

        if removed > 0 {
            log::info!("Purged {} expired history records", removed);
        }
        self.persist();
        removed
    }

    pub fn reset(&mut self) {
        self.records.clear();
        self.persist();
    }

    /// Case-insensitive match on country and topic. The returned iterator
    /// borrows the collection and can be cloned to walk it again.
    pub fn search<'a>(&'a self, query: &str) -> HistorySearch<'a> {
        HistorySearch {
            inner: self.records.iter(),
            query: query.to_lowercase(),
        }
    }

    #[cfg(test)]
    pub fn records(&self) -> &[LookupRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains_country(&self, country: &str) -> bool {
        self.records.iter().any(|r| r.country == country)
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let result = serde_json::to_string(&self.records)
            .map_err(anyhow::Error::from)
            .and_then(|json| store.set_item(HISTORY_STORAGE_KEY, &json));

        if let Err(e) = result {
            log::error!("Failed to persist history: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct HistorySearch<'a> {
    inner: std::slice::Iter<'a, LookupRecord>,
    query: String,
}

impl<'a> Iterator for HistorySearch<'a> {
    type Item = &'a LookupRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let query = &self.query;
        self.inner.find(|r| {
            r.country.to_lowercase().contains(query.as_str())
                || r.topic.as_str().to_lowercase().contains(query.as_str())
        })
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
pub(crate) struct ManualClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(start),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TimeFilter, Topic};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap()
    }

    fn headline(text: &str) -> NewsItem {
        NewsItem {
            headline: text.to_string(),
            date: "2024-05-02".to_string(),
            source_url: format!("https://example.com/{}", text.len()),
        }
    }

    fn france() -> LookupKey {
        LookupKey::new("France", TimeFilter::Last24Hours, Topic::General)
    }

    fn record_at(country: &str, topic: Topic, captured_at: DateTime<Utc>) -> LookupRecord {
        LookupRecord {
            country: country.to_string(),
            time_filter: TimeFilter::Last24Hours,
            topic,
            news_items: vec![headline(country)],
            country_stats: None,
            captured_at,
        }
    }

    fn cache_with_clock() -> (HistoryCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = HistoryCache::new(None, clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_record_then_hit_until_ttl() {
        let (mut cache, clock) = cache_with_clock();
        cache.record(france(), vec![headline("Strike ends")], None);

        clock.advance(Duration::hours(3) + Duration::minutes(59));
        let hit = cache.try_get(&france()).expect("fresh record");
        assert_eq!(hit.news_items[0].headline, "Strike ends");

        clock.advance(Duration::minutes(1));
        assert!(cache.try_get(&france()).is_none());
    }

    #[test]
    fn test_expired_read_removes_record() {
        let (mut cache, clock) = cache_with_clock();
        cache.record(france(), vec![headline("Old")], None);
        cache.record(
            LookupKey::new("Chad", TimeFilter::Last7Days, Topic::Tech),
            vec![],
            None,
        );

        clock.advance(Duration::hours(5));
        assert!(cache.try_get(&france()).is_none());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.records()[0].country, "Chad");
    }

    #[test]
    fn test_other_filters_miss() {
        let (mut cache, _clock) = cache_with_clock();
        cache.record(france(), vec![], None);

        assert!(cache
            .try_get(&LookupKey::new("France", TimeFilter::Last7Days, Topic::General))
            .is_none());
        assert!(cache
            .try_get(&LookupKey::new("France", TimeFilter::Last24Hours, Topic::Economy))
            .is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_newest_duplicate_wins() {
        let (mut cache, clock) = cache_with_clock();
        cache.record(france(), vec![headline("First")], None);
        clock.advance(Duration::minutes(10));
        cache.record(france(), vec![headline("Second")], None);

        assert_eq!(cache.len(), 2);
        let hit = cache.try_get(&france()).unwrap();
        assert_eq!(hit.news_items[0].headline, "Second");
    }

    #[test]
    fn test_record_caps_collection() {
        let (mut cache, clock) = cache_with_clock();
        for i in 0..25 {
            clock.advance(Duration::seconds(1));
            cache.record(
                LookupKey::new(format!("Country {}", i), TimeFilter::Last24Hours, Topic::General),
                vec![],
                None,
            );
        }

        assert_eq!(cache.len(), HISTORY_CAPACITY);
        assert_eq!(cache.records()[0].country, "Country 24");
        assert_eq!(cache.records()[HISTORY_CAPACITY - 1].country, "Country 5");
    }

    #[test]
    fn test_reset_then_miss() {
        let (mut cache, _clock) = cache_with_clock();
        cache.record(france(), vec![], None);
        cache.reset();

        assert!(cache.is_empty());
        assert!(cache.try_get(&france()).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let (mut cache, clock) = cache_with_clock();
        cache.record(france(), vec![], None);
        clock.advance(Duration::hours(3));
        cache.record(
            LookupKey::new("Peru", TimeFilter::Last24Hours, Topic::Politics),
            vec![],
            None,
        );
        clock.advance(Duration::hours(2));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.records()[0].country, "Peru");
    }

    #[test]
    fn test_merge_server_history_priority_and_order() {
        let (mut cache, _clock) = cache_with_clock();
        let t = start();
        cache.records = vec![
            record_at("France", Topic::General, t - Duration::minutes(5)),
            record_at("Japan", Topic::Tech, t - Duration::minutes(30)),
        ];

        let server = vec![
            record_at("France", Topic::General, t - Duration::minutes(50)),
            record_at("Brazil", Topic::General, t - Duration::minutes(10)),
        ];
        cache.merge_server_history(server);

        let order: Vec<(&str, i64)> = cache
            .records()
            .iter()
            .map(|r| (r.country.as_str(), (t - r.captured_at).num_minutes()))
            .collect();
        // The local France record is shadowed by the server's older one
        assert_eq!(order, vec![("Brazil", 10), ("Japan", 30), ("France", 50)]);
    }

    #[test]
    fn test_merge_server_history_caps_at_capacity() {
        let (mut cache, _clock) = cache_with_clock();
        let t = start();
        cache.records = (0..15)
            .map(|i| record_at(&format!("Local {}", i), Topic::General, t - Duration::minutes(i)))
            .collect();
        let server: Vec<LookupRecord> = (0..15)
            .map(|i| record_at(&format!("Server {}", i), Topic::General, t - Duration::minutes(i)))
            .collect();

        cache.merge_server_history(server);

        assert_eq!(cache.len(), HISTORY_CAPACITY);
        // On equal timestamps the server record comes first
        assert_eq!(cache.records()[0].country, "Server 0");
        assert_eq!(cache.records()[1].country, "Local 0");
    }

    #[test]
    fn test_merge_empty_server_history_is_noop() {
        let (mut cache, _clock) = cache_with_clock();
        cache.record(france(), vec![], None);
        cache.merge_server_history(Vec::new());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_search_is_case_insensitive_and_read_only() {
        let (mut cache, _clock) = cache_with_clock();
        cache.record(france(), vec![], None);
        cache.record(
            LookupKey::new("Germany", TimeFilter::Last24Hours, Topic::Tech),
            vec![],
            None,
        );

        let results = cache.search("FR");
        let countries: Vec<&str> = results.clone().map(|r| r.country.as_str()).collect();
        assert_eq!(countries, vec!["France"]);
        // Restartable
        assert_eq!(results.count(), 1);

        let by_topic: Vec<&str> = cache.search("tech").map(|r| r.country.as_str()).collect();
        assert_eq!(by_topic, vec!["Germany"]);

        assert_eq!(cache.search("").count(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_persists_and_reloads() {
        let store = LocalStore::in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(start()));

        let mut cache = HistoryCache::new(Some(store.clone()), clock.clone());
        cache.record(france(), vec![headline("Saved")], None);

        let mut reloaded = HistoryCache::load(store, clock);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.try_get(&france()).unwrap().news_items[0].headline, "Saved");
    }

    fn stored_cache() -> (HistoryCache, LocalStore, Arc<ManualClock>) {
        let store = LocalStore::in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let cache = HistoryCache::new(Some(store.clone()), clock.clone());
        (cache, store, clock)
    }

    #[test]
    fn test_expired_read_is_persisted() {
        let (mut cache, store, clock) = stored_cache();
        cache.record(france(), vec![], None);
        clock.advance(Duration::hours(5));

        assert!(cache.try_get(&france()).is_none());

        let reloaded = HistoryCache::load(store, clock);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_reset_is_persisted() {
        let (mut cache, store, clock) = stored_cache();
        cache.record(france(), vec![], None);
        cache.reset();

        let reloaded = HistoryCache::load(store, clock);
        assert!(reloaded.is_empty());
    }

    #[test]
    fn test_merge_is_persisted() {
        let (mut cache, store, clock) = stored_cache();
        cache.record(france(), vec![], None);
        cache.merge_server_history(vec![record_at(
            "Brazil",
            Topic::Economy,
            start() - Duration::minutes(10),
        )]);

        let reloaded = HistoryCache::load(store, clock);
        let countries: Vec<&str> = reloaded.records().iter().map(|r| r.country.as_str()).collect();
        assert_eq!(countries, vec!["France", "Brazil"]);
    }

    #[test]
    fn test_purge_is_persisted() {
        let (mut cache, store, clock) = stored_cache();
        cache.record(france(), vec![], None);
        clock.advance(Duration::hours(3));
        cache.record(
            LookupKey::new("Peru", TimeFilter::Last24Hours, Topic::Politics),
            vec![],
            None,
        );
        clock.advance(Duration::hours(2));

        assert_eq!(cache.purge_expired(), 1);

        let reloaded = HistoryCache::load(store, clock);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.records()[0].country, "Peru");
    }

    #[test]
    fn test_corrupt_storage_loads_empty() {
        let store = LocalStore::in_memory().unwrap();
        store.set_item(HISTORY_STORAGE_KEY, "{not json").unwrap();

        let cache = HistoryCache::load(store, Arc::new(SystemClock));
        assert!(cache.is_empty());
    }
}
