/// Transfer progress of one direction of an attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Progress {
    /// `transferred / total` when the total is known, otherwise `0` until done.
    pub percent: f64,
    pub transferred: u64,
    pub total: Option<u64>,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.percent >= 1.0
    }
}

#[derive(Debug)]
pub(crate) struct ProgressTracker {
    transferred: u64,
    total: Option<u64>,
}

impl ProgressTracker {
    pub(crate) fn new(total: Option<u64>) -> Self {
        Self {
            transferred: 0,
            total,
        }
    }

    pub(crate) fn snapshot(&self) -> Progress {
        let percent = match self.total {
            Some(0) => 0.0,
            // Capped below 1 so only `finish` reports completion.
            Some(total) => (self.transferred as f64 / total as f64).min(0.999_999),
            None => 0.0,
        };
        Progress {
            percent,
            transferred: self.transferred,
            total: self.total,
        }
    }

    pub(crate) fn advance(&mut self, chunk_len: usize) -> Progress {
        self.transferred = self.transferred.saturating_add(chunk_len as u64);
        if self.total.is_some_and(|total| total < self.transferred) {
            self.total = None;
        }
        self.snapshot()
    }

    pub(crate) fn finish(&mut self) -> Progress {
        self.total = Some(self.transferred);
        Progress {
            percent: 1.0,
            transferred: self.transferred,
            total: Some(self.transferred),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_totals_report_fractions() {
        let mut tracker = ProgressTracker::new(Some(10));
        assert_eq!(tracker.snapshot().percent, 0.0);
        assert_eq!(tracker.advance(5).percent, 0.5);
        let last = tracker.advance(5);
        assert!(last.percent < 1.0);
        let done = tracker.finish();
        assert_eq!(done.percent, 1.0);
        assert_eq!(done.total, Some(10));
    }

    #[test]
    fn unknown_totals_stay_at_zero_until_finished() {
        let mut tracker = ProgressTracker::new(None);
        assert_eq!(tracker.advance(3).percent, 0.0);
        assert_eq!(tracker.advance(4).transferred, 7);
        let done = tracker.finish();
        assert!(done.is_complete());
        assert_eq!(done.transferred, 7);
        assert_eq!(done.total, Some(7));
    }

    #[test]
    fn overshooting_the_declared_total_drops_it() {
        let mut tracker = ProgressTracker::new(Some(2));
        let progress = tracker.advance(4);
        assert_eq!(progress.total, None);
        assert_eq!(progress.percent, 0.0);
    }
}
