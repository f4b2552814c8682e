//! The fixed aggregations computed over the population and BLS datasets.

use std::collections::{BTreeMap, HashMap};

use popbls_core::{BlsRecord, PopulationRecord};
use serde::Serialize;

/// Population summary over an inclusive year window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopulationStats {
    pub from_year: i32,
    pub to_year: i32,
    pub count: usize,
    /// `None` when no record falls in the window.
    pub mean: Option<f64>,
    /// Sample standard deviation (n - 1). `None` with fewer than two records.
    pub stddev: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestYear {
    pub series_id: String,
    pub year: i32,
    /// Sum of every period's value for `series_id` in `year`.
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JoinedRow {
    pub series_id: String,
    pub year: i32,
    pub period: String,
    pub value: f64,
    pub population: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    /// Store key of the population snapshot the report was computed from.
    pub population_key: String,
    pub population_stats: PopulationStats,
    pub best_years: Vec<BestYear>,
    pub joined: Vec<JoinedRow>,
}

fn in_window(year: i32, (from, to): (i32, i32)) -> bool {
    (from..=to).contains(&year)
}

/// Mean of the populations in the year window, or `None` if it is empty.
pub fn mean_population(records: &[PopulationRecord], window: (i32, i32)) -> Option<f64> {
    let values: Vec<f64> = records
        .iter()
        .filter(|r| in_window(r.year, window))
        .map(|r| r.population as f64)
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn population_stats(records: &[PopulationRecord], window: (i32, i32)) -> PopulationStats {
    let values: Vec<f64> = records
        .iter()
        .filter(|r| in_window(r.year, window))
        .map(|r| r.population as f64)
        .collect();
    let count = values.len();
    let mean = (count > 0).then(|| values.iter().sum::<f64>() / count as f64);
    let stddev = match mean {
        Some(mean) if count >= 2 => {
            let sum_sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            Some((sum_sq / (count - 1) as f64).sqrt())
        }
        _ => None,
    };
    PopulationStats {
        from_year: window.0,
        to_year: window.1,
        count,
        mean,
        stddev,
    }
}

/// For each series, the year whose summed value across periods is largest.
///
/// Ties go to the smallest year. Output is sorted by series id.
pub fn best_year_per_series(records: &[BlsRecord]) -> Vec<BestYear> {
    let mut sums: BTreeMap<(&str, i32), f64> = BTreeMap::new();
    for record in records {
        *sums.entry((record.series_id.as_str(), record.year)).or_default() += record.value;
    }

    // Iteration is ordered by (series, year), so a strict `>` keeps the
    // earliest year on ties.
    let mut best: BTreeMap<&str, (i32, f64)> = BTreeMap::new();
    for ((series_id, year), value) in sums {
        match best.get(series_id) {
            Some((_, current)) if value <= *current => {}
            _ => {
                best.insert(series_id, (year, value));
            }
        }
    }

    best.into_iter()
        .map(|(series_id, (year, value))| BestYear {
            series_id: series_id.to_string(),
            year,
            value,
        })
        .collect()
}

/// Rows of `series_id`/`period` inner-joined with population on year,
/// sorted by year.
pub fn join_series_population(
    bls: &[BlsRecord],
    population: &[PopulationRecord],
    series_id: &str,
    period: &str,
) -> Vec<JoinedRow> {
    let by_year: HashMap<i32, i64> = population.iter().map(|p| (p.year, p.population)).collect();

    let mut rows: Vec<JoinedRow> = bls
        .iter()
        .filter(|r| r.series_id == series_id && r.period == period)
        .filter_map(|r| {
            by_year.get(&r.year).map(|population| JoinedRow {
                series_id: r.series_id.clone(),
                year: r.year,
                period: r.period.clone(),
                value: r.value,
                population: *population,
            })
        })
        .collect();
    rows.sort_by_key(|row| row.year);
    rows
}
