use crate::controller::manager::MetricLog;
use crate::crd::trial::{Metric, Observation, UNAVAILABLE_METRIC_VALUE};
use chrono::{DateTime, Utc};

#[derive(Default)]
struct Accumulator {
    min: Option<(f64, String)>,
    max: Option<(f64, String)>,
    latest: Option<String>,
    latest_timestamp: Option<DateTime<Utc>>,
}

impl Accumulator {
    fn observe(&mut self, sample: &MetricLog) {
        let raw = sample.value.trim();
        if let Ok(value) = raw.parse::<f64>() {
            if value.is_finite() {
                // Emit the reported string, not a re-formatted f64
                if self.min.as_ref().map_or(true, |(m, _)| value < *m) {
                    self.min = Some((value, raw.to_string()));
                }
                if self.max.as_ref().map_or(true, |(m, _)| value > *m) {
                    self.max = Some((value, raw.to_string()));
                }
            }
        }

        // "Not before" the recorded timestamp: ties go to the later sample in input order
        match parse_timestamp(&sample.timestamp) {
            Some(ts) => {
                if self.latest_timestamp.map_or(true, |recorded| ts >= recorded) {
                    self.latest_timestamp = Some(ts);
                    self.latest = Some(sample.value.clone());
                }
            }
            None => {
                if self.latest_timestamp.is_none() {
                    self.latest = Some(sample.value.clone());
                }
            }
        }
    }

    fn into_metric(self, name: &str) -> Metric {
        let format = |v: Option<(f64, String)>| {
            v.map(|(_, raw)| raw)
                .unwrap_or_else(|| UNAVAILABLE_METRIC_VALUE.to_string())
        };
        Metric {
            name: name.to_string(),
            min: format(self.min),
            max: format(self.max),
            latest: self
                .latest
                .unwrap_or_else(|| UNAVAILABLE_METRIC_VALUE.to_string()),
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Reduce metric samples to a {min, max, latest} summary per tracked metric
///
/// Every tracked metric appears in the result, in `tracked` order; metrics
/// with no samples stay at the unavailable sentinel. Samples for untracked
/// metrics are ignored. Min and max only consider values that parse as numbers.
pub fn aggregate(samples: &[MetricLog], tracked: &[String]) -> Observation {
    let mut accumulators: Vec<(&str, Accumulator)> = tracked
        .iter()
        .map(|name| (name.as_str(), Accumulator::default()))
        .collect();

    for sample in samples {
        if let Some((_, acc)) = accumulators
            .iter_mut()
            .find(|(name, _)| *name == sample.metric_name)
        {
            acc.observe(sample);
        }
    }

    Observation {
        metrics: accumulators
            .into_iter()
            .map(|(name, acc)| acc.into_metric(name))
            .collect(),
    }
}
