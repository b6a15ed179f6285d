//! Per-type population history as a sliding window

use crate::types::TypeName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Time series of object counts for every type ever observed
///
/// All series always have the same length, equal to the number of recorded samples
/// (at most `max_history`). Types that disappear keep receiving zeros so their curve
/// decays instead of vanishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeHistory {
    series: BTreeMap<TypeName, VecDeque<u64>>,
    samples: usize,
    max_history: usize,
    last_sample_at: Option<DateTime<Utc>>,
}

/// Min/current/max summary of one series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesStats {
    pub type_name: TypeName,
    pub min: u64,
    pub current: u64,
    pub max: u64,
}

impl TypeHistory {
    /// Create an empty history keeping at most `max_history` samples per type
    pub fn new(max_history: usize) -> Self {
        Self {
            series: BTreeMap::new(),
            samples: 0,
            max_history: max_history.max(1),
            last_sample_at: None,
        }
    }

    /// Record one census tick
    ///
    /// Observed types get their count appended (new ones are zero-filled first), all
    /// other tracked types get a zero, and once the window is full every series drops
    /// its oldest entry.
    pub fn record(&mut self, counts: &HashMap<TypeName, u64>) {
        for (type_name, count) in counts {
            let samples = self.samples;
            self.series
                .entry(type_name.clone())
                .or_insert_with(|| VecDeque::from(vec![0; samples]))
                .push_back(*count);
        }

        let expected = self.samples + 1;
        for series in self.series.values_mut() {
            if series.len() < expected {
                series.resize(expected, 0);
            }
        }

        if expected > self.max_history {
            for series in self.series.values_mut() {
                series.pop_front();
            }
        } else {
            self.samples = expected;
        }
        self.last_sample_at = Some(Utc::now());
    }

    /// Number of samples currently held per series
    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn last_sample_at(&self) -> Option<DateTime<Utc>> {
        self.last_sample_at
    }

    /// Copy of one type's series, oldest first
    pub fn series(&self, type_name: &str) -> Option<Vec<u64>> {
        self.series
            .get(type_name)
            .map(|series| series.iter().copied().collect())
    }

    /// Tracked type names in sorted order
    pub fn type_names(&self) -> Vec<TypeName> {
        self.series.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Summaries of every series whose peak exceeds `floor`, sorted by type name
    pub fn stats(&self, floor: u64) -> Vec<SeriesStats> {
        self.series
            .iter()
            .filter_map(|(type_name, series)| {
                let max = series.iter().copied().max()?;
                if max <= floor {
                    return None;
                }
                Some(SeriesStats {
                    type_name: type_name.clone(),
                    min: series.iter().copied().min().unwrap_or(0),
                    current: series.back().copied().unwrap_or(0),
                    max,
                })
            })
            .collect()
    }

    /// Series lengths all match the sample counter
    pub fn is_consistent(&self) -> bool {
        self.series.values().all(|series| series.len() == self.samples)
    }
}

impl Default for TypeHistory {
    fn default() -> Self {
        Self::new(300)
    }
}
