use chrono::{DateTime, TimeZone, Utc};

/// Clock used for event timestamps and `first_seen_at`/`last_seen_at`.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Epoch milliseconds, the wire format of `occurred_at` and `failed_at`.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always returns the same instant, for tests comparing stored timestamps.
#[derive(Clone)]
pub struct FixedTime {
    pub time: DateTime<Utc>,
}

impl FixedTime {
    pub fn from_millis(millis: i64) -> Self {
        let time = Utc
            .timestamp_millis_opt(millis)
            .single()
            .unwrap_or_default();
        Self { time }
    }
}

impl TimeSource for FixedTime {
    fn now(&self) -> DateTime<Utc> {
        self.time
    }
}
