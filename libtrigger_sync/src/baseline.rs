/// Estimates the resting level of one channel from a run of auto-triggered records.
///
/// For each record the median sample value is kept. Once enough records are in, the
/// baseline is the lowest median for positive-going pulses or the highest for
/// negative-going pulses: records containing a pulse push the median away from rest,
/// so the extreme median on the far side is the quietest record seen.
#[derive(Debug, Clone)]
pub struct BaselineFinder {
    positive_pulses: bool,
    records_required: usize,
    medians: Vec<f64>,
}

impl BaselineFinder {
    pub fn new(positive_pulses: bool, records_required: usize) -> Self {
        Self {
            positive_pulses,
            records_required,
            medians: Vec::with_capacity(records_required),
        }
    }

    /// Add one record. Samples are read as raw 16-bit ADC values.
    pub fn add_record(&mut self, samples: &[i64]) {
        if samples.is_empty() || self.is_complete() {
            return;
        }
        let mut values: Vec<u16> = samples.iter().map(|s| *s as u16).collect();
        values.sort_unstable();
        let mid = values.len() / 2;
        let median = if values.len() % 2 == 0 {
            (values[mid - 1] as f64 + values[mid] as f64) / 2.0
        } else {
            values[mid] as f64
        };
        self.medians.push(median);
    }

    pub fn records_seen(&self) -> usize {
        self.medians.len()
    }

    pub fn is_complete(&self) -> bool {
        self.medians.len() >= self.records_required
    }

    /// The baseline estimate so far, None before the first record
    pub fn baseline(&self) -> Option<f64> {
        let medians = self.medians.iter().copied();
        if self.positive_pulses {
            medians.reduce(f64::min)
        } else {
            medians.reduce(f64::max)
        }
    }
}

//Unit tests
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_takes_lowest_median() {
        let mut finder = BaselineFinder::new(true, 3);
        assert_eq!(finder.baseline(), None);
        finder.add_record(&[100, 101, 99, 5000]);
        finder.add_record(&[98, 98, 97, 99, 98]);
        assert!(!finder.is_complete());
        finder.add_record(&[2000, 2100, 1900]);
        assert!(finder.is_complete());
        assert_eq!(finder.baseline(), Some(98.0));
        // Further records are ignored once complete
        finder.add_record(&[1, 1, 1]);
        assert_eq!(finder.records_seen(), 3);
    }

    #[test]
    fn test_negative_takes_highest_median() {
        let mut finder = BaselineFinder::new(false, 2);
        finder.add_record(&[1000, 1002]);
        finder.add_record(&[500, 400, 600]);
        assert_eq!(finder.baseline(), Some(1001.0));
    }

    #[test]
    fn test_negative_samples_wrap_to_u16() {
        let mut finder = BaselineFinder::new(true, 1);
        finder.add_record(&[-1, -1, -1]);
        assert_eq!(finder.baseline(), Some(65535.0));
    }
}
