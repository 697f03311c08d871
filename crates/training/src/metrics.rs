use std::collections::BTreeMap;

/// Running arithmetic mean over scalar samples.
#[derive(Debug, Default, Clone)]
pub struct AverageMeter {
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, sample: f64) {
        self.sum += sample;
        self.count += 1;
    }

    fn count(&self) -> usize {
        self.count
    }

    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Per-epoch scalar statistics, produced fresh each epoch by the epoch
/// executor and consumed by the metric sink. Ordered so log records are
/// stable across runs.
#[derive(Debug, Default, Clone)]
pub struct EpochStats {
    values: BTreeMap<String, f64>,
}

impl EpochStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(name, value)| (name.as_str(), *value))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meter_averages_samples() {
        let mut meter = AverageMeter::default();
        assert_eq!(meter.average(), 0.0);
        meter.update(1.0);
        meter.update(3.0);
        assert_eq!(meter.average(), 2.0);
        assert_eq!(meter.count(), 2);
    }

    #[test]
    fn stats_iterate_in_name_order() {
        let mut stats = EpochStats::new();
        stats.insert("lr", 0.1);
        stats.insert("loss", 0.5);
        let names: Vec<&str> = stats.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["loss", "lr"]);
    }
}
