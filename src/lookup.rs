use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;

use crate::api_client::{ApiResult, InfomapClient};
use crate::history::HistoryCache;
use crate::models::{LookupKey, LookupRecord, NewsResponse};

/// Anything that can answer a news lookup over the network.
pub trait NewsSource: Send + Sync {
    fn fetch_news(&self, key: &LookupKey) -> ApiResult<NewsResponse>;
}

impl NewsSource for InfomapClient {
    fn fetch_news(&self, key: &LookupKey) -> ApiResult<NewsResponse> {
        InfomapClient::fetch_news(self, key)
    }
}

#[derive(Clone, Default)]
struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct InFlight {
    key: LookupKey,
    cancel: CancelToken,
    receiver: Receiver<ApiResult<NewsResponse>>,
}

#[derive(Debug)]
pub enum LookupStart {
    /// Fresh cached result, no request was made
    Hit(LookupRecord),
    Started,
    /// A request for the same key is already running
    AlreadyLoading,
}

#[derive(Debug)]
pub enum LookupEvent {
    Loaded { record: LookupRecord, quota: Option<u32> },
    Failed { key: LookupKey, message: String },
}

/// Sits between country selection and the news endpoint.
///
/// The cache is consulted first; a miss runs the request on a worker thread.
/// Only one request is tracked at a time: starting a lookup for another key
/// cancels the running one, and a cancelled request never writes to the
/// cache.
pub struct CountryLookup {
    source: Arc<dyn NewsSource>,
    in_flight: Option<InFlight>,
}

impl CountryLookup {
    pub fn new(source: Arc<dyn NewsSource>) -> Self {
        Self {
            source,
            in_flight: None,
        }
    }

    pub fn start(&mut self, key: LookupKey, cache: &mut HistoryCache) -> LookupStart {
        if let Some(record) = cache.try_get(&key) {
            self.cancel();
            log::debug!(
                "Cache hit for {} / {} / {}",
                key.country,
                key.time_filter.as_str(),
                key.topic.as_str()
            );
            return LookupStart::Hit(record);
        }

        if self.in_flight.as_ref().is_some_and(|f| f.key == key) {
            return LookupStart::AlreadyLoading;
        }

        self.cancel();

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::default();
        let worker_cancel = cancel.clone();
        let worker_key = key.clone();
        let source = Arc::clone(&self.source);

        log::info!(
            "Fetching news for {} / {} / {}",
            key.country,
            key.time_filter.as_str(),
            key.topic.as_str()
        );
        thread::spawn(move || {
            let result = source.fetch_news(&worker_key);
            if !worker_cancel.is_cancelled() {
                let _ = tx.send(result);
            }
        });

        self.in_flight = Some(InFlight {
            key,
            cancel,
            receiver: rx,
        });
        LookupStart::Started
    }

    /// Abandons the running request, if any. Its result will be dropped.
    pub fn cancel(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            flight.cancel.cancel();
            log::debug!("Cancelled lookup for {}", flight.key.country);
        }
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn loading_key(&self) -> Option<&LookupKey> {
        self.in_flight.as_ref().map(|f| &f.key)
    }

    /// Non-blocking check for the running request. A successful answer is
    /// recorded in `cache` before it is returned.
    pub fn poll(&mut self, cache: &mut HistoryCache) -> Option<LookupEvent> {
        let flight = self.in_flight.take()?;

        let result = match flight.receiver.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => {
                self.in_flight = Some(flight);
                return None;
            }
            Err(TryRecvError::Disconnected) => {
                return Some(LookupEvent::Failed {
                    key: flight.key,
                    message: "Lookup stopped before the backend answered".to_string(),
                });
            }
        };

        if flight.cancel.is_cancelled() {
            return None;
        }

        match result {
            Ok(response) => {
                let record = cache
                    .record(flight.key, response.news, response.stats)
                    .clone();
                Some(LookupEvent::Loaded {
                    record,
                    quota: response.quota,
                })
            }
            Err(e) => {
                log::warn!("News lookup for {} failed: {}", flight.key.country, e);
                Some(LookupEvent::Failed {
                    key: flight.key,
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiError;
    use crate::history::ManualClock;
    use crate::models::{NewsItem, TimeFilter, Topic};
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration as StdDuration, Instant};

    struct FakeSource {
        calls: AtomicUsize,
        delay: StdDuration,
        refuse_with: Option<String>,
    }

    impl FakeSource {
        fn new(delay_ms: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: StdDuration::from_millis(delay_ms),
                refuse_with: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl NewsSource for FakeSource {
        fn fetch_news(&self, key: &LookupKey) -> ApiResult<NewsResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            thread::sleep(self.delay);

            if let Some(detail) = &self.refuse_with {
                return Err(ApiError::Rejected {
                    status: 429,
                    detail: detail.clone(),
                });
            }

            Ok(NewsResponse {
                news: vec![NewsItem {
                    headline: format!("{} headline #{}", key.country, call),
                    date: "2024-05-02".to_string(),
                    source_url: "https://example.com".to_string(),
                }],
                stats: None,
                quota: Some(call as u32),
            })
        }
    }

    fn wait_for_event(lookup: &mut CountryLookup, cache: &mut HistoryCache) -> LookupEvent {
        let deadline = Instant::now() + StdDuration::from_secs(5);
        loop {
            if let Some(event) = lookup.poll(cache) {
                return event;
            }
            assert!(Instant::now() < deadline, "lookup never finished");
            thread::sleep(StdDuration::from_millis(5));
        }
    }

    fn setup(
        source: FakeSource,
    ) -> (CountryLookup, HistoryCache, Arc<FakeSource>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 2, 8, 0, 0).unwrap()));
        let cache = HistoryCache::new(None, clock.clone());
        let source = Arc::new(source);
        let lookup = CountryLookup::new(source.clone());
        (lookup, cache, source, clock)
    }

    fn france() -> LookupKey {
        LookupKey::new("France", TimeFilter::Last24Hours, Topic::General)
    }

    #[test]
    fn test_fresh_record_skips_network_until_expired() {
        let (mut lookup, mut cache, source, clock) = setup(FakeSource::new(0));
        cache.record(france(), vec![], None);
        clock.advance(Duration::hours(1));

        assert!(matches!(lookup.start(france(), &mut cache), LookupStart::Hit(_)));
        assert_eq!(source.calls(), 0);

        clock.advance(Duration::hours(5));
        assert!(matches!(lookup.start(france(), &mut cache), LookupStart::Started));
        match wait_for_event(&mut lookup, &mut cache) {
            LookupEvent::Loaded { record, quota } => {
                assert_eq!(record.news_items[0].headline, "France headline #1");
                assert_eq!(quota, Some(1));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(source.calls(), 1);

        match lookup.start(france(), &mut cache) {
            LookupStart::Hit(record) => {
                assert_eq!(record.news_items[0].headline, "France headline #1")
            }
            other => panic!("expected a cache hit, got {:?}", other),
        }
        assert_eq!(source.calls(), 1);
    }

    #[test]
    fn test_failure_leaves_cache_untouched() {
        let mut source = FakeSource::new(0);
        source.refuse_with = Some("Daily quota exceeded".to_string());
        let (mut lookup, mut cache, _source, _clock) = setup(source);

        lookup.start(france(), &mut cache);
        match wait_for_event(&mut lookup, &mut cache) {
            LookupEvent::Failed { key, message } => {
                assert_eq!(key, france());
                assert_eq!(message, "Daily quota exceeded");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(cache.is_empty());
        assert!(!lookup.is_loading());
    }

    #[test]
    fn test_same_key_is_not_fetched_twice() {
        let (mut lookup, mut cache, source, _clock) = setup(FakeSource::new(50));

        assert!(matches!(lookup.start(france(), &mut cache), LookupStart::Started));
        assert!(matches!(lookup.start(france(), &mut cache), LookupStart::AlreadyLoading));
        wait_for_event(&mut lookup, &mut cache);

        assert_eq!(source.calls(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_switching_country_discards_stale_result() {
        let (mut lookup, mut cache, _source, _clock) = setup(FakeSource::new(50));
        let chad = LookupKey::new("Chad", TimeFilter::Last24Hours, Topic::General);

        lookup.start(france(), &mut cache);
        lookup.start(chad.clone(), &mut cache);
        assert_eq!(lookup.loading_key(), Some(&chad));

        match wait_for_event(&mut lookup, &mut cache) {
            LookupEvent::Loaded { record, .. } => assert_eq!(record.country, "Chad"),
            other => panic!("unexpected event {:?}", other),
        }

        thread::sleep(StdDuration::from_millis(100));
        assert!(lookup.poll(&mut cache).is_none());
        assert_eq!(cache.len(), 1);
        assert!(!cache.contains_country("France"));
    }

    #[test]
    fn test_cancel_drops_pending_result() {
        let (mut lookup, mut cache, _source, _clock) = setup(FakeSource::new(20));

        lookup.start(france(), &mut cache);
        lookup.cancel();
        thread::sleep(StdDuration::from_millis(60));

        assert!(!lookup.is_loading());
        assert!(lookup.poll(&mut cache).is_none());
        assert!(cache.is_empty());
    }
}
