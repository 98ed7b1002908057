use super::round_off_2_decimals;
use serde::Serialize;
use std::cmp::Ordering;

/// Classification bands on the 0–20 scale. Lower bound inclusive, upper
/// bound exclusive except for the last band.
pub const GRADE_BANDS: [(&str, f64, f64); 4] = [
    ("0-9", 0.0, 10.0),
    ("10-13", 10.0, 14.0),
    ("14-16", 14.0, 17.0),
    ("17-20", 17.0, 20.0),
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributionBand {
    pub label: &'static str,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatistics {
    pub total: usize,
    pub passed_count: usize,
    pub failed_count: usize,
    pub pass_rate: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub distribution: Vec<DistributionBand>,
}

fn compute_median(sorted: &[f64]) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

fn band_index(v: f64) -> usize {
    GRADE_BANDS
        .iter()
        .position(|(_, _, max)| v < *max)
        .unwrap_or(GRADE_BANDS.len() - 1)
}

/// Class-level summary of the defined final grades in scope. An empty
/// input yields zeroed fields.
pub fn class_statistics(grades: &[f64], pass_mark: f64) -> ClassStatistics {
    let mut sorted: Vec<f64> = grades.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let total = sorted.len();
    let passed_count = sorted.iter().filter(|v| **v >= pass_mark).count();
    let failed_count = total - passed_count;

    let mut distribution: Vec<DistributionBand> = GRADE_BANDS
        .iter()
        .map(|(label, min, max)| DistributionBand {
            label: *label,
            min: *min,
            max: *max,
            count: 0,
        })
        .collect();
    for v in &sorted {
        distribution[band_index(*v)].count += 1;
    }

    if total == 0 {
        return ClassStatistics {
            total,
            passed_count,
            failed_count,
            pass_rate: 0.0,
            mean: 0.0,
            median: 0.0,
            min: 0.0,
            max: 0.0,
            distribution,
        };
    }

    let mean = sorted.iter().sum::<f64>() / (total as f64);
    ClassStatistics {
        total,
        passed_count,
        failed_count,
        pass_rate: (passed_count as f64) / (total as f64),
        mean: round_off_2_decimals(mean),
        median: round_off_2_decimals(compute_median(&sorted)),
        min: sorted[0],
        max: sorted[total - 1],
        distribution,
    }
}
