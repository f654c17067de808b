use std::sync::atomic::{AtomicU64, Ordering};

/// Weight of the newest sample.
const RTT_ALPHA: f64 = 0.2;

/// Exponentially weighted moving average of round trip times in
/// milliseconds, shared between a monitor and its RTT pinger.
#[derive(Debug)]
pub(crate) struct RoundTripTime {
    /// Bits of an f64; NaN until the first sample arrives.
    average: AtomicU64,
}

impl Default for RoundTripTime {
    fn default() -> Self {
        Self {
            average: AtomicU64::new(f64::NAN.to_bits()),
        }
    }
}

impl RoundTripTime {
    /// Folds in a new sample and returns the updated average. The first
    /// sample seeds the average.
    pub(crate) fn add_sample(&self, sample_ms: f64) -> f64 {
        let mut current_bits = self.average.load(Ordering::Acquire);
        loop {
            let current = f64::from_bits(current_bits);
            let next = if current.is_nan() {
                sample_ms
            } else {
                RTT_ALPHA * sample_ms + (1.0 - RTT_ALPHA) * current
            };
            match self.average.compare_exchange_weak(
                current_bits,
                next.to_bits(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(updated_bits) => current_bits = updated_bits,
            }
        }
    }

    /// The current average, or `None` before the first sample.
    pub(crate) fn average(&self) -> Option<f64> {
        let average = f64::from_bits(self.average.load(Ordering::Acquire));
        (!average.is_nan()).then_some(average)
    }

    pub(crate) fn reset(&self) {
        self.average.store(f64::NAN.to_bits(), Ordering::Release);
    }
}
