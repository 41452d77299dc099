//! Loop / Breaker Guard (§4.8): counts wake/reply actions per
//! `(session_or_default, sender_prefix)`, trips a breaker when a sender
//! exceeds its effective threshold within a 30-minute window, and raises a
//! deduplicated knock-pattern alert independent of breaker tripping.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::node_id::{BreakerTarget, NodePrefix};
use crate::store::{Breaker, Store};

const WAKE_WINDOW_SECONDS: i64 = 30 * 60;
const SOLICITED_WINDOW_SECONDS: i64 = 60 * 60;
const KNOCK_WINDOW_SECONDS: i64 = 60 * 60;
const BREAKER_AUTO_EXPIRE_SECONDS: u64 = 3600;

/// The `Breaker::reason` stamped by [`LoopGuard::trip_breaker`] — callers
/// checking a breaker's origin (e.g. the pipeline's journal tagging) match
/// against this rather than a private string literal.
pub const LOOP_BREAKER_REASON: &str = "loop_threshold_exceeded";

type ReplyKey = (String, String);
type SolicitedKey = (String, String);

pub struct LoopGuard {
    loop_threshold: u32,
    loop_threshold_sessionless: u32,
    knock_threshold: u32,
    max_counter_entries: usize,
    reply_counter: Mutex<crate::lru::BoundedLru<ReplyKey, VecDeque<DateTime<Utc>>>>,
    solicited: Mutex<crate::lru::BoundedLru<SolicitedKey, DateTime<Utc>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripOutcome {
    pub tripped: bool,
    pub count_in_window: usize,
    pub effective_threshold: u32,
}

impl LoopGuard {
    pub fn new(
        loop_threshold: u32,
        loop_threshold_sessionless: u32,
        knock_threshold: u32,
        max_counter_entries: usize,
    ) -> Self {
        Self {
            loop_threshold,
            loop_threshold_sessionless,
            knock_threshold,
            max_counter_entries,
            reply_counter: Mutex::new(crate::lru::BoundedLru::new(max_counter_entries)),
            solicited: Mutex::new(crate::lru::BoundedLru::new(max_counter_entries)),
        }
    }

    /// Records that we sent mail to `sender` within `session_id` — makes
    /// that sender "solicited" for the session for the next hour.
    pub fn record_send(&self, sender: &NodePrefix, session_key: &str, now: DateTime<Utc>) {
        let mut solicited = self.solicited.lock().unwrap();
        solicited.insert((sender.to_string(), session_key.to_string()), now);
    }

    pub fn is_solicited(&self, sender: &NodePrefix, session_key: &str, now: DateTime<Utc>) -> bool {
        let mut solicited = self.solicited.lock().unwrap();
        match solicited.get(&(sender.to_string(), session_key.to_string())) {
            Some(ts) => (now - *ts).num_seconds() < SOLICITED_WINDOW_SECONDS,
            None => false,
        }
    }

    fn effective_threshold(&self, session_present: bool, solicited: bool) -> u32 {
        let base = if session_present {
            self.loop_threshold
        } else {
            self.loop_threshold_sessionless
        };
        if solicited {
            base * 2
        } else {
            base
        }
    }

    /// Records a wake/reply action for `sender` and reports whether the
    /// effective threshold was exceeded — firing on the `(threshold + 1)`-th
    /// event within the window, not the `threshold`-th.
    pub fn record_wake_and_check(
        &self,
        sender: &NodePrefix,
        session_id: Option<&str>,
        session_key: &str,
        now: DateTime<Utc>,
    ) -> TripOutcome {
        let solicited = self.is_solicited(sender, session_key, now);
        let effective_threshold = self.effective_threshold(session_id.is_some(), solicited);

        let mut counter = self.reply_counter.lock().unwrap();
        let entry = counter.entry_or_insert_with(
            (session_key.to_string(), sender.to_string()),
            VecDeque::new,
        );
        entry.push_back(now);
        while let Some(front) = entry.front() {
            if (now - *front).num_seconds() > WAKE_WINDOW_SECONDS {
                entry.pop_front();
            } else {
                break;
            }
        }
        let count_in_window = entry.len();

        TripOutcome {
            tripped: count_in_window as u32 > effective_threshold,
            count_in_window,
            effective_threshold,
        }
    }

    /// Writes a breaker file for `sender` and returns the breaker so the
    /// caller can emit the system mail and journal stamp.
    pub fn trip_breaker(
        &self,
        store: &Store,
        sender: &NodePrefix,
        now: DateTime<Utc>,
    ) -> Result<Breaker, crate::store::breaker::BreakerError> {
        let target = BreakerTarget::Sender(sender.clone());
        let mut trip_count = 1;
        if let Some(existing) = store.breakers.read_validated(&target)? {
            trip_count = existing.trip_count + 1;
        }
        let mut breaker = Breaker::new(&target, LOOP_BREAKER_REASON, BREAKER_AUTO_EXPIRE_SECONDS, now);
        breaker.trip_count = trip_count;
        store.breakers.write(&breaker)?;
        Ok(breaker)
    }

    /// Knock pattern (§4.8): sustained drops from one sender in the
    /// trailing hour, deduplicated to one alert per hour via a store flag.
    /// Returns `true` exactly when a fresh alert should be sent.
    pub fn check_knock_pattern(
        &self,
        store: &Store,
        sender: &NodePrefix,
        now: DateTime<Utc>,
    ) -> crate::error::Result<bool> {
        let drops = store.classifications_drop_count_since(
            sender.as_str(),
            now - chrono::Duration::seconds(KNOCK_WINDOW_SECONDS),
        )?;
        if drops < self.knock_threshold {
            return Ok(false);
        }
        let flag_key = format!("knock_alert:{}", sender.as_str());
        if store.flag_get(&flag_key, now)?.is_some() {
            return Ok(false);
        }
        store.flag_set(
            &flag_key,
            "1",
            Some(now + chrono::Duration::seconds(KNOCK_WINDOW_SECONDS)),
        )?;
        Ok(true)
    }

    pub fn max_counter_entries(&self) -> usize {
        self.max_counter_entries
    }
}
