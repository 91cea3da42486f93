use log::debug;

use super::{HOUR_HISTORY_POINTS, MINUTE_HISTORY_POINTS, Resolution, RingStatBuffer, WindowStats};

/// Seconds covered by the raw tier
const RAW_HISTORY_SECS: usize = 3600;

/// Values below this are drawn as an empty bar
const BAR_FLOOR_PPM: f32 = 400.0;

/// `log2(400)`, rounded down so that the floor maps to a zero-height bar
const BAR_LOG2_OFFSET: f32 = 8.64;

/// Pixels per doubling of concentration
const BAR_PIXELS_PER_OCTAVE: f32 = 30.0;

/// Why a tick did not insert a raw sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The sensor reported the zero error sentinel
    ErrorSample,
    /// The wall-clock second is not on the sensor's sampling cadence
    OffCadence,
}

/// What a call to [`HistoryAggregator::tick`] recorded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    Rejected(RejectReason),
    /// A raw sample was stored
    Raw,
    /// A raw sample and a one-minute average were stored
    Minute { minute_avg: f32 },
    /// A raw sample, a one-minute average and a one-hour average were stored
    Hour { minute_avg: f32, hour_avg: f32 },
}

impl TickOutcome {
    /// True when a raw sample was accepted
    pub fn accepted(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

/// Downsamples raw CO2 readings into minute and hour histories.
///
/// ## Tiers
///
/// - **raw**: one hour at the sensor's native period (5 s → 720 samples)
/// - **minute**: 60 one-minute averages
/// - **hour**: 24 one-hour averages
///
/// Aggregation is phase-locked to the wall clock rather than counted: a
/// minute average is taken when `seconds == 0`, an hour average when both
/// `seconds == 0` and `minutes == 0`. If the scheduler misses the tick that
/// lands exactly on a boundary, that aggregate is skipped for the cycle.
#[derive(Debug, Clone)]
pub struct HistoryAggregator {
    raw: RingStatBuffer,
    minute: RingStatBuffer,
    hour: RingStatBuffer,
    sample_period_secs: u16,
    samples_per_minute: usize,
}

impl HistoryAggregator {
    /// Create an aggregator whose raw tier spans one hour at `sample_period_secs`.
    pub fn new(sample_period_secs: u16) -> Self {
        let period = usize::from(sample_period_secs.max(1));
        Self::with_raw_capacity(sample_period_secs, RAW_HISTORY_SECS / period)
    }

    /// Create an aggregator with an explicit raw tier size.
    ///
    /// Hour averages are always taken over the whole raw tier, so a raw
    /// capacity shorter than an hour shortens the hour window with it.
    pub fn with_raw_capacity(sample_period_secs: u16, raw_capacity: usize) -> Self {
        let period = sample_period_secs.max(1);
        Self {
            raw: RingStatBuffer::new(raw_capacity),
            minute: RingStatBuffer::new(MINUTE_HISTORY_POINTS),
            hour: RingStatBuffer::new(HOUR_HISTORY_POINTS),
            sample_period_secs: period,
            samples_per_minute: (60 / usize::from(period)).max(1),
        }
    }

    /// Feed the current reading at wall-clock `minutes:seconds`.
    ///
    /// May be called more often than the sampling period; only seconds that
    /// are a multiple of the period store anything. A zero reading is the
    /// sensor's error sentinel and is never stored.
    pub fn tick(&mut self, raw_value: u16, seconds: u8, minutes: u8) -> TickOutcome {
        if raw_value == 0 {
            return TickOutcome::Rejected(RejectReason::ErrorSample);
        }
        if u16::from(seconds) % self.sample_period_secs != 0 {
            return TickOutcome::Rejected(RejectReason::OffCadence);
        }

        self.raw.add_value(f32::from(raw_value));

        if seconds != 0 {
            return TickOutcome::Raw;
        }

        let Some(minute_avg) = self.raw.average_last(self.samples_per_minute) else {
            return TickOutcome::Raw;
        };
        self.minute.add_value(minute_avg);
        debug!(
            "Minute average {:.1} ppm ({} minute points)",
            minute_avg,
            self.minute.count()
        );

        if minutes != 0 {
            return TickOutcome::Minute { minute_avg };
        }

        let Some(hour_avg) = self.raw.average() else {
            return TickOutcome::Minute { minute_avg };
        };
        self.hour.add_value(hour_avg);
        debug!(
            "Hour average {:.1} ppm over {} raw samples ({} hour points)",
            hour_avg,
            self.raw.count(),
            self.hour.count()
        );

        TickOutcome::Hour {
            minute_avg,
            hour_avg,
        }
    }

    pub fn raw(&self) -> &RingStatBuffer {
        &self.raw
    }

    pub fn minute(&self) -> &RingStatBuffer {
        &self.minute
    }

    pub fn hour(&self) -> &RingStatBuffer {
        &self.hour
    }

    /// Buffer backing a given tier
    pub fn buffer(&self, resolution: Resolution) -> &RingStatBuffer {
        match resolution {
            Resolution::Raw => &self.raw,
            Resolution::Minute => &self.minute,
            Resolution::Hour => &self.hour,
        }
    }

    /// Min/max/average over the displayed window of a tier
    pub fn window_stats(&self, resolution: Resolution) -> Option<WindowStats> {
        WindowStats::over_last(self.buffer(resolution), resolution.display_points())
    }

    pub fn sample_period_secs(&self) -> u16 {
        self.sample_period_secs
    }

    pub fn samples_per_minute(&self) -> usize {
        self.samples_per_minute
    }

    /// Empty all three tiers
    pub fn clear(&mut self) {
        self.raw.clear();
        self.minute.clear();
        self.hour.clear();
    }
}

/// Height in pixels of a history bar for `value` ppm.
///
/// Logarithmic, so the typical 400–5000 ppm range fills the display. Values
/// below 400 ppm are raised to 400 first, which keeps the mapping monotonic
/// over the whole valid domain and makes 400 ppm a zero-height bar.
pub fn bar_height(value: f32, max_height: u16) -> u16 {
    let ppm = value.max(BAR_FLOOR_PPM);
    let height = BAR_PIXELS_PER_OCTAVE * (libm::log2f(ppm) - BAR_LOG2_OFFSET);
    if height <= 0.0 {
        0
    } else if height >= f32::from(max_height) {
        max_height
    } else {
        height as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tick once per sampling period from `start_sec` of `minute`, wrapping
    /// into the next minute.
    fn feed(history: &mut HistoryAggregator, values: &[u16], mut minute: u8, mut second: u8) {
        let period = history.sample_period_secs() as u8;
        for &v in values {
            history.tick(v, second, minute);
            second += period;
            if second >= 60 {
                second -= 60;
                minute = (minute + 1) % 60;
            }
        }
    }

    #[test]
    fn test_raw_capacity_spans_one_hour() {
        assert_eq!(HistoryAggregator::new(5).raw().capacity(), 720);
        assert_eq!(HistoryAggregator::new(2).raw().capacity(), 1800);
        assert_eq!(HistoryAggregator::new(1).raw().capacity(), 3600);
        assert_eq!(HistoryAggregator::new(5).samples_per_minute(), 12);
        assert_eq!(HistoryAggregator::new(5).minute().capacity(), 60);
        assert_eq!(HistoryAggregator::new(5).hour().capacity(), 24);
    }

    #[test]
    fn test_zero_sample_is_never_stored() {
        let mut history = HistoryAggregator::new(5);

        assert_eq!(
            history.tick(0, 0, 0),
            TickOutcome::Rejected(RejectReason::ErrorSample)
        );
        assert!(history.raw().is_empty());
        assert!(history.minute().is_empty());
        assert!(history.hour().is_empty());
    }

    #[test]
    fn test_off_cadence_seconds_are_ignored() {
        let mut history = HistoryAggregator::new(5);

        for second in 1..5 {
            assert_eq!(
                history.tick(800, second, 10),
                TickOutcome::Rejected(RejectReason::OffCadence)
            );
        }
        assert_eq!(history.tick(800, 5, 10), TickOutcome::Raw);
        assert_eq!(history.raw().count(), 1);
    }

    #[test]
    fn test_minute_average_of_constant_samples() {
        let mut history = HistoryAggregator::new(5);
        // 11 samples at :05..:55, the 12th lands on :00 of the next minute
        feed(&mut history, &[400; 12], 14, 5);

        assert_eq!(history.minute().count(), 1);
        let last = history.minute().count() - 1;
        assert_eq!(history.minute().get_value(last), Ok(400.0));
        assert!(history.hour().is_empty());
    }

    #[test]
    fn test_minute_average_uses_only_last_minute_of_raw() {
        let mut history = HistoryAggregator::new(5);
        feed(&mut history, &[2000; 12], 20, 5);
        feed(&mut history, &[600; 12], 21, 5);

        assert_eq!(history.minute().count(), 2);
        assert_eq!(history.minute().get_value(0), Ok(2000.0));
        assert_eq!(history.minute().get_value(1), Ok(600.0));
    }

    #[test]
    fn test_hour_average_over_full_raw_buffer() {
        let mut history = HistoryAggregator::with_raw_capacity(5, 12);
        let values: [u16; 12] = core::array::from_fn(|i| 500 + 10 * i as u16);

        // :05 .. :55 of minute 59, then :00 of minute 0
        feed(&mut history, &values[..11], 59, 5);
        assert!(!history.raw().is_full());
        let outcome = history.tick(values[11], 0, 0);

        assert!(history.raw().is_full());
        assert_eq!(
            outcome,
            TickOutcome::Hour {
                minute_avg: 555.0,
                hour_avg: 555.0
            }
        );
        assert_eq!(history.hour().get_value(0), Ok(555.0));
    }

    #[test]
    fn test_missed_boundary_skips_aggregate() {
        let mut history = HistoryAggregator::new(5);
        // Ticks at :55 and :05 only; the :00 tick never arrives
        history.tick(700, 55, 3);
        history.tick(700, 5, 4);

        assert_eq!(history.raw().count(), 2);
        assert!(history.minute().is_empty());
    }

    #[test]
    fn test_duplicate_boundary_tick_is_tolerated() {
        let mut history = HistoryAggregator::new(5);
        history.tick(700, 0, 30);
        history.tick(700, 0, 30);

        assert_eq!(history.minute().count(), 2);
        assert_eq!(history.raw().count(), 2);
    }

    #[test]
    fn test_window_stats_for_tier() {
        let mut history = HistoryAggregator::new(5);
        feed(&mut history, &[450, 500, 550], 10, 5);

        let stats = history.window_stats(Resolution::Raw).unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 450.0);
        assert_eq!(stats.max, 550.0);
        assert_eq!(stats.avg, 500.0);
        assert_eq!(history.window_stats(Resolution::Hour), None);
    }

    #[test]
    fn test_bar_height_floor_is_zero() {
        assert_eq!(bar_height(400.0, 150), 0);
        assert_eq!(bar_height(250.0, 150), 0);
        assert_eq!(bar_height(0.0, 150), 0);
    }

    #[test]
    fn test_bar_height_is_monotonic_and_clamped() {
        let mut previous = 0;
        let mut ppm = 400.0;
        while ppm <= 65535.0 {
            let h = bar_height(ppm, 150);
            assert!(h >= previous, "bar height fell at {} ppm", ppm);
            assert!(h <= 150);
            previous = h;
            ppm += 37.0;
        }
        // 800 ppm is one octave above the floor
        assert_eq!(bar_height(800.0, 150), 30);
        assert_eq!(bar_height(60000.0, 150), 150);
    }
}
