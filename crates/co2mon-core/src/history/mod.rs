//! Multi-resolution CO2 history.
//!
//! Raw sensor readings are kept for one hour, downsampled into one-minute
//! averages (kept for one hour) and one-hour averages (kept for one day).

pub mod aggregator;
pub mod ring;

pub use aggregator::*;
pub use ring::RingStatBuffer;

/// Number of one-minute aggregates retained (one hour)
pub const MINUTE_HISTORY_POINTS: usize = 60;

/// Number of one-hour aggregates retained (one day)
pub const HOUR_HISTORY_POINTS: usize = 24;

/// History tier a buffer belongs to
///
/// Each tier is a coarser time-average of the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Raw samples at the sensor's native period
    Raw,
    /// One-minute averages
    Minute,
    /// One-hour averages
    Hour,
}

impl Resolution {
    /// Get a short label for display
    pub const fn label(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Minute => "1m",
            Self::Hour => "1h",
        }
    }

    /// Number of most recent points a bar graph of this tier shows.
    ///
    /// Fewer than the buffer holds, otherwise bars get too narrow.
    pub const fn display_points(self) -> usize {
        match self {
            Self::Raw => 24,
            Self::Minute => 30,
            Self::Hour => 24,
        }
    }

    /// Cycle to the next tier, wrapping back to raw
    pub const fn next(self) -> Self {
        match self {
            Self::Raw => Self::Minute,
            Self::Minute => Self::Hour,
            Self::Hour => Self::Raw,
        }
    }
}

/// Statistics over the displayed window of one tier
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WindowStats {
    pub min: f32,
    pub max: f32,
    pub avg: f32,
    /// Number of points the statistics cover
    pub count: usize,
}

impl WindowStats {
    /// Statistics over the last `k` entries of `buffer`, or `None` if empty.
    pub fn over_last(buffer: &RingStatBuffer, k: usize) -> Option<Self> {
        Some(Self {
            min: buffer.min_last(k)?,
            max: buffer.max_last(k)?,
            avg: buffer.average_last(k)?,
            count: k.min(buffer.count()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_cycles_through_all_tiers() {
        let start = Resolution::Raw;
        assert_eq!(start.next(), Resolution::Minute);
        assert_eq!(start.next().next(), Resolution::Hour);
        assert_eq!(start.next().next().next(), Resolution::Raw);
    }

    #[test]
    fn test_window_stats_covers_display_points() {
        let mut buffer = RingStatBuffer::new(60);
        for i in 0..40 {
            buffer.add_value(400.0 + i as f32);
        }

        let stats = WindowStats::over_last(&buffer, Resolution::Minute.display_points()).unwrap();
        assert_eq!(stats.count, 30);
        assert_eq!(stats.min, 410.0);
        assert_eq!(stats.max, 439.0);
        assert_eq!(stats.avg, 424.5);
    }

    #[test]
    fn test_window_stats_empty_buffer() {
        let buffer = RingStatBuffer::new(24);
        assert_eq!(WindowStats::over_last(&buffer, 24), None);
    }
}
