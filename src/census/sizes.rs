//! On-demand per-type memory footprint

use crate::error::Result;
use crate::heap::HeapSnapshotProvider;
use crate::types::TypeName;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Label shown wherever a size is not known
pub const UNKNOWN_SIZE: &str = "unknown size";

/// Render a byte count on a binary scale.
///
/// Zero means "not measured" and renders as [`UNKNOWN_SIZE`].
pub fn format_size(bytes: u64) -> String {
    if bytes == 0 {
        UNKNOWN_SIZE.to_string()
    } else if bytes < 1 << 10 {
        bytes.to_string()
    } else if bytes < 1 << 20 {
        format!("{} Kb", bytes >> 10)
    } else if bytes < 1 << 30 {
        format!("{} Mb", bytes >> 20)
    } else if bytes < 1 << 40 {
        format!("{} Gb", bytes >> 30)
    } else {
        bytes.to_string()
    }
}

/// Formatted cumulative size per type, as of the last refresh
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeSizeTable {
    sizes: HashMap<TypeName, String>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl TypeSizeTable {
    /// Size label for a type; unknown when never measured
    pub fn label(&self, type_name: &str) -> String {
        self.sizes
            .get(type_name)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_SIZE.to_string())
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Computes a fresh [`TypeSizeTable`] from a full heap scan
pub struct SizeAggregator;

impl SizeAggregator {
    /// Scan the heap and build a replacement table
    ///
    /// Objects the estimator cannot measure contribute nothing.
    pub fn aggregate(provider: &dyn HeapSnapshotProvider) -> Result<TypeSizeTable> {
        provider.collect();
        let snapshot = provider.snapshot()?;

        let mut totals: HashMap<TypeName, u64> = HashMap::new();
        let mut unmeasurable = 0usize;
        for handle in snapshot.objects() {
            let size = provider.estimate_size(handle).unwrap_or_else(|_| {
                unmeasurable += 1;
                0
            });
            *totals.entry(handle.type_name.clone()).or_insert(0) += size;
        }

        if unmeasurable > 0 {
            debug!(unmeasurable, "objects skipped by size estimator");
        }
        info!(
            types = totals.len(),
            objects = snapshot.len(),
            "type sizes aggregated"
        );

        Ok(TypeSizeTable {
            sizes: totals
                .into_iter()
                .map(|(type_name, bytes)| (type_name, format_size(bytes)))
                .collect(),
            refreshed_at: Some(Utc::now()),
        })
    }
}
