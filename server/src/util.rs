use chrono::{DateTime, Utc};

/// Calendar-day stamp used in day-scoped lock and counter names.
pub fn day_stamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d").to_string()
}
