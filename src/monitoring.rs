//! Rolling request counters.
//!
//! Each request increments three counters (requests, queries, processing
//! time) in one bucket per duration {60 s, 1 h, 24 h}. Bucket keys embed
//! `floor(now / duration)` and expire after one duration, so the cache
//! garbage-collects history by itself.

use crate::cache::Cache;
use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use std::time::Duration;

const BUCKET_DURATIONS: &[u64] = &[60, 3600, 86400];

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BucketRates {
    pub request_rate: f64,
    pub query_rate: f64,
    pub processing_time_per_query: Option<f64>,
    /// Seconds the current bucket has been accumulating.
    pub measure_duration: u64,
    pub measure_duration_target: u64,
}

#[derive(Clone)]
pub struct Monitoring {
    cache: Cache,
}

impl Monitoring {
    pub fn new(cache: Cache) -> Self {
        Monitoring { cache }
    }

    fn now() -> u64 {
        Utc::now().timestamp().max(0) as u64
    }

    fn bucket_key(&self, duration: u64, now: u64, counter: &str) -> String {
        let bucket = now / duration;
        self.cache.key(&[
            "monitoring",
            &duration.to_string(),
            &bucket.to_string(),
            counter,
        ])
    }

    pub async fn log_request(&self, queries: u64, processing_time: f64) -> Result<()> {
        let now = Self::now();
        for &duration in BUCKET_DURATIONS {
            let ttl = Duration::from_secs(duration);
            self.cache
                .incr_with_ttl(&self.bucket_key(duration, now, "req_count"), 1, ttl)
                .await?;
            self.cache
                .incr_with_ttl(
                    &self.bucket_key(duration, now, "query_count"),
                    queries as i64,
                    ttl,
                )
                .await?;
            self.cache
                .incr_float_with_ttl(
                    &self.bucket_key(duration, now, "processing_time"),
                    processing_time,
                    ttl,
                )
                .await?;
        }
        Ok(())
    }

    pub async fn get_rates(&self) -> Result<Vec<BucketRates>> {
        let now = Self::now();
        let mut rates = Vec::with_capacity(BUCKET_DURATIONS.len());
        for &duration in BUCKET_DURATIONS {
            let req_count = self.read_counter(duration, now, "req_count").await;
            let query_count = self.read_counter(duration, now, "query_count").await;
            let processing_time = self.read_counter(duration, now, "processing_time").await;

            let elapsed = (now % duration).max(1) as f64;
            rates.push(BucketRates {
                request_rate: req_count / elapsed,
                query_rate: query_count / elapsed,
                processing_time_per_query: if query_count > 0.0 {
                    Some(processing_time / query_count)
                } else {
                    None
                },
                measure_duration: now % duration,
                measure_duration_target: duration,
            });
        }
        Ok(rates)
    }

    async fn read_counter(&self, duration: u64, now: u64, counter: &str) -> f64 {
        self.cache
            .get(&self.bucket_key(duration, now, counter))
            .await
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.0)
    }
}
