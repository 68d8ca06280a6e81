use std::str::FromStr;

use thiserror::Error;

use crate::bbi::Summary;

/// The statistic computed per bin by `stats`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StatType {
    Mean,
    Min,
    Max,
    Sum,
    /// Fraction of the bases in a bin that have data
    Coverage,
    /// Sample standard deviation over the bases with data
    Std,
}

#[derive(Error, Debug)]
#[error("Unknown statistic: {0}")]
pub struct UnknownStatError(String);

impl FromStr for StatType {
    type Err = UnknownStatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "mean" | "average" => StatType::Mean,
            "min" => StatType::Min,
            "max" => StatType::Max,
            "sum" => StatType::Sum,
            "coverage" | "cov" => StatType::Coverage,
            "std" | "dev" => StatType::Std,
            _ => return Err(UnknownStatError(s.to_owned())),
        })
    }
}

/// Splits `[start, end)` into `n_bins` ranges of equal width. The last bin
/// also takes whatever is left over.
///
/// `n_bins` must be in `1..=end - start`.
pub(crate) fn stat_bins(start: u32, end: u32, n_bins: u32) -> Vec<(u32, u32)> {
    let width = (end - start) / n_bins;
    (0..n_bins)
        .map(|i| {
            let bin_start = start + i * width;
            let bin_end = if i == n_bins - 1 {
                end
            } else {
                bin_start + width
            };
            (bin_start, bin_end)
        })
        .collect()
}

/// The coarsest zoom resolution whose records tile `[bin_start, bin_end)`
/// exactly, if any. `resolutions` must be sorted in ascending order.
pub(crate) fn zoom_for_bin(
    resolutions: &[u32],
    bin_start: u32,
    bin_end: u32,
    chrom_length: u32,
) -> Option<u32> {
    resolutions.iter().rev().copied().find(|&r| {
        r <= bin_end - bin_start
            && bin_start % r == 0
            && (bin_end % r == 0 || bin_end == chrom_length)
    })
}

/// Running totals over the bases of one bin.
#[derive(Copy, Clone, Debug)]
pub(crate) struct BinStats {
    summary: Summary,
}

impl BinStats {
    pub(crate) fn new() -> Self {
        BinStats {
            summary: Summary::empty(),
        }
    }

    pub(crate) fn add_value(&mut self, bases: u32, value: f32) {
        if bases > 0 {
            self.summary.add(bases, f64::from(value));
        }
    }

    pub(crate) fn add_summary(&mut self, summary: &Summary) {
        self.summary.merge(summary);
    }

    /// The requested statistic over a bin of `width` bases.
    pub(crate) fn get(&self, stat: StatType, width: u32) -> Option<f64> {
        let s = &self.summary;
        let bases = s.bases_covered as f64;
        match stat {
            StatType::Sum => Some(s.sum),
            StatType::Coverage => Some(bases / f64::from(width)),
            _ if s.bases_covered == 0 => None,
            StatType::Mean => Some(s.sum / bases),
            StatType::Min => Some(s.min_val),
            StatType::Max => Some(s.max_val),
            StatType::Std if s.bases_covered == 1 => Some(0.0),
            StatType::Std => {
                let var = (s.sum_squares - s.sum * s.sum / bases) / (bases - 1.0);
                Some(var.max(0.0).sqrt())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stat_bins() {
        assert_eq!(stat_bins(0, 10, 1), vec![(0, 10)]);
        assert_eq!(stat_bins(0, 10, 3), vec![(0, 3), (3, 6), (6, 10)]);
        assert_eq!(stat_bins(5, 8, 3), vec![(5, 6), (6, 7), (7, 8)]);
    }

    #[test]
    fn test_zoom_for_bin() {
        let resolutions = [40, 160, 640];
        assert_eq!(zoom_for_bin(&resolutions, 0, 640, 10_000), Some(640));
        assert_eq!(zoom_for_bin(&resolutions, 0, 600, 10_000), Some(40));
        assert_eq!(zoom_for_bin(&resolutions, 20, 600, 10_000), None);
        assert_eq!(zoom_for_bin(&resolutions, 320, 650, 650), Some(160));
        assert_eq!(zoom_for_bin(&resolutions, 0, 30, 10_000), None);
    }

    #[test]
    fn test_bin_stats() {
        let mut stats = BinStats::new();
        assert_eq!(stats.get(StatType::Mean, 10), None);
        assert_eq!(stats.get(StatType::Sum, 10), Some(0.0));
        assert_eq!(stats.get(StatType::Coverage, 10), Some(0.0));

        stats.add_value(2, 1.0);
        stats.add_value(2, 3.0);
        assert_eq!(stats.get(StatType::Mean, 10), Some(2.0));
        assert_eq!(stats.get(StatType::Min, 10), Some(1.0));
        assert_eq!(stats.get(StatType::Max, 10), Some(3.0));
        assert_eq!(stats.get(StatType::Sum, 10), Some(8.0));
        assert_eq!(stats.get(StatType::Coverage, 10), Some(0.4));
        // Bases 1, 1, 3, 3: sample variance is 4/3
        let std = stats.get(StatType::Std, 10).unwrap();
        assert!((std - (4.0f64 / 3.0).sqrt()).abs() < 1e-12);

        let mut single = BinStats::new();
        single.add_value(1, 5.0);
        assert_eq!(single.get(StatType::Std, 1), Some(0.0));
    }

    #[test]
    fn test_parse_stat() {
        assert_eq!("average".parse::<StatType>().unwrap(), StatType::Mean);
        assert_eq!("cov".parse::<StatType>().unwrap(), StatType::Coverage);
        assert_eq!("dev".parse::<StatType>().unwrap(), StatType::Std);
        assert!("median".parse::<StatType>().is_err());
    }
}
