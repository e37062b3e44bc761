// Copyright 2025 evalpool Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::snapshot::HistogramSummary;
use std::sync::atomic::{AtomicU64, Ordering};

/// Decades covered by the histogram: values from 1 up to 10^10.
const DECADES: usize = 10;
/// Leading digits 1-9 within each decade.
const DIGITS: usize = 9;
/// One bin for zero plus one bin per (decade, leading digit).
const NUM_BINS: usize = 1 + DECADES * DIGITS;

/// Logarithmic histogram for percentile estimation.
///
/// Each power of ten is split into nine bins keyed by the leading digit of
/// the sample, so relative resolution is constant across the range. Samples
/// are unit-agnostic `u64`s: the engine records durations in microseconds and
/// code sizes in bytes.
///
/// # Bin Structure
///
/// - Bin 0: exactly zero
/// - Bins 1-9: 1..10 (one bin per value)
/// - Bins 10-18: 10..100 (10-19, 20-29, ...)
/// - ... and so on up to 10^10, larger samples land in the last bin
///
/// # Performance
///
/// Recording is a handful of relaxed atomic increments. Percentile estimation
/// scans the 91 bins once.
#[derive(Debug)]
pub struct LogHistogram {
    bins: [AtomicU64; NUM_BINS],
    sum: AtomicU64,
    count: AtomicU64,
}

impl LogHistogram {
    pub fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records one sample.
    pub fn record(&self, value: u64) {
        self.bins[Self::value_to_bin(value)].fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    fn value_to_bin(value: u64) -> usize {
        if value == 0 {
            return 0;
        }

        let decade = value.ilog10() as usize;
        if decade >= DECADES {
            return NUM_BINS - 1;
        }

        let leading = (value / 10u64.pow(decade as u32)) as usize;
        1 + decade * DIGITS + (leading - 1)
    }

    /// Inclusive lower bound and exclusive upper bound of a bin.
    fn bin_bounds(bin: usize) -> (u64, u64) {
        if bin == 0 {
            return (0, 1);
        }

        let decade = (bin - 1) / DIGITS;
        let leading = ((bin - 1) % DIGITS + 1) as u64;
        let scale = 10u64.pow(decade as u32);
        (leading * scale, (leading + 1) * scale)
    }

    /// Estimates the value at `percentile` (0-100), interpolating inside the bin.
    ///
    /// Returns 0 when no samples were recorded.
    pub fn percentile(&self, percentile: u64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }

        let target = ((total * percentile.min(100)).div_ceil(100)).max(1);
        let mut cumulative = 0;

        for (bin, counter) in self.bins.iter().enumerate() {
            let in_bin = counter.load(Ordering::Relaxed);
            if in_bin == 0 {
                continue;
            }
            if cumulative + in_bin >= target {
                let (low, high) = Self::bin_bounds(bin);
                let fraction = (target - cumulative) as f64 / in_bin as f64;
                let estimate = low + ((high - low) as f64 * fraction) as u64;
                return estimate.clamp(low, high - 1);
            }
            cumulative += in_bin;
        }

        Self::bin_bounds(NUM_BINS - 1).1
    }

    /// Count, mean and the usual percentiles in one pass-friendly struct.
    pub fn summary(&self) -> HistogramSummary {
        let count = self.count();
        if count == 0 {
            return HistogramSummary::default();
        }

        HistogramSummary {
            count,
            avg: self.sum() / count,
            p50: self.percentile(50),
            p95: self.percentile(95),
            p99: self.percentile(99),
        }
    }
}

impl Default for LogHistogram {
    fn default() -> Self {
        Self::new()
    }
}
