use std::fs;
use std::path::Path;

use log::debug;

use crate::error::WaveformError;

/// Snap tolerance: a query this close to a sample time returns the
/// sample value exactly, avoiding division by a near-zero interval
/// width at the period boundary.
const SNAP: f64 = 1e-8;

/// A periodic, piecewise-linear boundary-condition signal.
///
/// Built from a two-column sample file (one `<time> <value>` pair per
/// line, whitespace- or comma-separated, optional header line). The
/// signal wraps at the period boundary: time 0 and time = period are
/// the same instant. Immutable after construction, so `lookup` can be
/// called from the engine's background thread without locking.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformTable {
    samples: Vec<(f64, f64)>,
    period: f64,
}

impl WaveformTable {
    /// Load a waveform whose period is the last sample time plus the
    /// final step between samples.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, WaveformError> {
        let samples = read_samples(path.as_ref())?;
        let n = samples.len();
        let period = samples[n - 1].0 + (samples[n - 1].0 - samples[n - 2].0);
        Self::from_samples(samples, period)
    }

    /// Load a waveform with an explicitly supplied period.
    pub fn from_file_with_period<P: AsRef<Path>>(
        path: P,
        period: f64,
    ) -> Result<Self, WaveformError> {
        let samples = read_samples(path.as_ref())?;
        Self::from_samples(samples, period)
    }

    /// Build a waveform from in-memory samples. Samples are sorted by
    /// time; a later duplicate time replaces an earlier one.
    pub fn from_samples(
        mut samples: Vec<(f64, f64)>,
        period: f64,
    ) -> Result<Self, WaveformError> {
        if samples.len() < 2 {
            return Err(WaveformError::TooFewSamples("<memory>".to_string()));
        }
        if period <= 0.0 {
            return Err(WaveformError::BadPeriod(period));
        }
        samples.sort_by(|a, b| a.0.total_cmp(&b.0));
        samples.dedup_by(|next, prev| {
            if (next.0 - prev.0).abs() <= SNAP {
                prev.1 = next.1;
                true
            } else {
                false
            }
        });
        debug!(
            "waveform table: {} samples, period {}",
            samples.len(),
            period
        );
        Ok(WaveformTable { samples, period })
    }

    pub fn period(&self) -> f64 {
        self.period
    }

    pub fn samples(&self) -> &[(f64, f64)] {
        &self.samples
    }

    /// Evaluate the signal at time `t`.
    ///
    /// `t` is reduced modulo the period, then bracketed by the first
    /// sample strictly after it ("high") and that sample's predecessor
    /// ("low"). When no sample lies strictly after, the bracket wraps
    /// across the period boundary to the first sample. A query within
    /// `1e-8` of a sample time returns that sample's value exactly;
    /// otherwise the two bracket samples are linearly interpolated.
    pub fn lookup(&self, t: f64) -> f64 {
        let tc = t.rem_euclid(self.period);
        let n = self.samples.len();

        let idx = self.samples.partition_point(|s| s.0 <= tc);
        let (low, high) = if idx == n {
            // tc is past the last sample: the bracket crosses the
            // period boundary into the first sample of the next cycle.
            let first = self.samples[0];
            (self.samples[n - 1], (first.0 + self.period, first.1))
        } else if idx == 0 {
            // tc is before the first sample: the low end of the bracket
            // is the last sample of the previous cycle.
            let last = self.samples[n - 1];
            ((last.0 - self.period, last.1), self.samples[0])
        } else {
            (self.samples[idx - 1], self.samples[idx])
        };

        if (high.0 - tc).abs() <= SNAP {
            return high.1;
        }
        if (low.0 - tc).abs() <= SNAP {
            return low.1;
        }
        low.1 + (tc - low.0) * (high.1 - low.1) / (high.0 - low.0)
    }

    /// Cheap validation used before a file is accepted from the user:
    /// true if every line holds exactly two numeric tokens (after the
    /// optional header).
    pub fn check_file<P: AsRef<Path>>(path: P) -> bool {
        read_samples(path.as_ref()).is_ok()
    }
}

fn read_samples(path: &Path) -> Result<Vec<(f64, f64)>, WaveformError> {
    let display = path.display().to_string();
    let content = fs::read_to_string(path).map_err(|source| WaveformError::Io {
        path: display.clone(),
        source,
    })?;

    let mut samples = Vec::new();
    let mut first_data_line = true;
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_sample(line) {
            Some(pair) => {
                samples.push(pair);
                first_data_line = false;
            }
            // A single non-numeric header line may precede the samples.
            None if first_data_line => first_data_line = false,
            None => {
                return Err(WaveformError::Format {
                    path: display,
                    line: lineno + 1,
                })
            }
        }
    }

    if samples.len() < 2 {
        return Err(WaveformError::TooFewSamples(display));
    }
    Ok(samples)
}

fn parse_sample(line: &str) -> Option<(f64, f64)> {
    let mut tokens = line
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty());
    let time = tokens.next()?.parse::<f64>().ok()?;
    let value = tokens.next()?.parse::<f64>().ok()?;
    if tokens.next().is_some() {
        return None;
    }
    Some((time, value))
}
