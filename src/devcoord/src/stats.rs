// Copyright (c) 2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

use serde::{Deserialize, Serialize};

/// Summary of a sample, used for suspend latency reporting.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SummaryStatistics {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub std_dev: f64,
    /// Middle value; the mean of the two middle values for even counts.
    pub median: f64,
}

impl SummaryStatistics {
    /// Returns `None` for an empty sample.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));

        let count = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / count;
        let variance = sorted.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;

        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        };

        Some(SummaryStatistics {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            std_dev: variance.sqrt(),
            median,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_statistics() {
        let stats = SummaryStatistics::from_values(&[200.0, 6.0, 110.0, 100.0]).unwrap();
        assert_eq!(stats.min, 6.0);
        assert_eq!(stats.max, 200.0);
        assert_eq!(stats.mean, 104.0);
        assert_eq!(stats.median, 105.0);
        assert_eq!(stats.std_dev.trunc(), 68.0);

        let odd = SummaryStatistics::from_values(&[6.0, 100.0, 110.0, 200.0, 300.0]).unwrap();
        assert_eq!(odd.median, 110.0);
        assert_eq!(odd.max, 300.0);
    }

    #[test]
    fn test_degenerate_samples() {
        assert!(SummaryStatistics::from_values(&[]).is_none());

        let one = SummaryStatistics::from_values(&[42.0]).unwrap();
        assert_eq!(one.min, 42.0);
        assert_eq!(one.median, 42.0);
        assert_eq!(one.std_dev, 0.0);
    }
}
