//! 15-minute computation grid: horizon arithmetic, resampling of raw
//! connector samples, and gap interpolation.

use chrono::{DateTime, Duration, Utc};

/// Grid step. All tariffs, offers and schedules are quarter-hourly.
pub const STEP_MINUTES: i64 = 15;

const STEP_SECONDS: i64 = STEP_MINUTES * 60;

/// Half-open computation horizon `[start, end)` aligned to the 15' grid.
///
/// A request for `2024-05-16T00:00:00Z` to `2024-05-16T00:45:00Z` covers the
/// three intervals starting at 00:00, 00:15 and 00:30.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Horizon {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl Horizon {
    /// Builds a horizon, rejecting unaligned or empty ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, String> {
        if start.timestamp() % STEP_SECONDS != 0 || end.timestamp() % STEP_SECONDS != 0 {
            return Err(format!(
                "start_datetime and end_datetime must be aligned to the {STEP_MINUTES}-minute grid"
            ));
        }
        if end <= start {
            return Err("end_datetime must be after start_datetime".to_string());
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    /// Number of 15' intervals in the horizon.
    pub fn steps(&self) -> usize {
        ((self.end - self.start).num_seconds() / STEP_SECONDS) as usize
    }

    /// Interval duration in hours.
    pub fn dt_hours(&self) -> f64 {
        STEP_MINUTES as f64 / 60.0
    }

    /// Start timestamp of every interval, in order.
    pub fn timestamps(&self) -> Vec<DateTime<Utc>> {
        (0..self.steps())
            .map(|i| self.start + Duration::seconds(i as i64 * STEP_SECONDS))
            .collect()
    }

    /// Fetch range with one extra interval on each side, so edge intervals
    /// can be interpolated from neighboring samples.
    pub fn buffered(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            self.start - Duration::seconds(STEP_SECONDS),
            self.end + Duration::seconds(STEP_SECONDS),
        )
    }
}

/// Serializes a grid timestamp the way the API exposes it.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// One raw observation from a connector.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: f64,
}

/// Resamples power-like observations: per-interval arithmetic mean.
pub fn resample_mean(samples: &[Sample], horizon: &Horizon) -> Vec<Option<f64>> {
    grid_series(samples, horizon, |values| {
        values.iter().sum::<f64>() / values.len() as f64
    })
}

/// Resamples energy-like observations: per-interval sum.
pub fn resample_sum(samples: &[Sample], horizon: &Horizon) -> Vec<Option<f64>> {
    grid_series(samples, horizon, |values| values.iter().sum())
}

/// Grid timestamps (API format) of intervals that remain unobserved.
pub fn missing_timestamps(series: &[Option<f64>], horizon: &Horizon) -> Vec<String> {
    horizon
        .timestamps()
        .into_iter()
        .zip(series)
        .filter(|(_, v)| v.is_none())
        .map(|(at, _)| format_timestamp(at))
        .collect()
}

/// Aggregates samples on a grid extended by one buffer interval on each
/// side, fills interior gaps by linear interpolation, and trims the buffers.
///
/// Intervals before the first or after the last observed interval stay
/// `None`: uncovered horizon edges are reported as missing data rather than
/// extrapolated.
fn grid_series(
    samples: &[Sample],
    horizon: &Horizon,
    reduce: impl Fn(&[f64]) -> f64,
) -> Vec<Option<f64>> {
    let (buffer_start, _) = horizon.buffered();
    let slots = horizon.steps() + 2;

    let mut buckets: Vec<Vec<f64>> = vec![Vec::new(); slots];
    for sample in samples {
        let offset = (sample.at - buffer_start).num_seconds();
        if offset < 0 {
            continue;
        }
        let slot = (offset / STEP_SECONDS) as usize;
        if slot < slots {
            buckets[slot].push(sample.value);
        }
    }

    let mut series: Vec<Option<f64>> = buckets
        .iter()
        .map(|bucket| {
            if bucket.is_empty() {
                None
            } else {
                Some(reduce(bucket))
            }
        })
        .collect();

    interpolate_gaps(&mut series);
    series[1..slots - 1].to_vec()
}

/// Linearly fills `None` runs that are bounded by observed values on both
/// sides. Leading and trailing gaps are left untouched.
pub fn interpolate_gaps(series: &mut [Option<f64>]) {
    let known: Vec<usize> = series
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|_| i))
        .collect();

    for pair in known.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b - a <= 1 {
            continue;
        }
        let (va, vb) = (series[a].unwrap_or(0.0), series[b].unwrap_or(0.0));
        for i in a + 1..b {
            let frac = (i - a) as f64 / (b - a) as f64;
            series[i] = Some(va + (vb - va) * frac);
        }
    }
}
