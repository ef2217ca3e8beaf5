/// Allocator configuration. No file or environment parsing lives here —
/// that belongs to whatever binary assembles a `Config` and hands it to
/// [`crate::Allocator::new`], the same division of labor `common::Policy`
/// draws between a plain settings struct and its callers.
#[derive(Debug, Clone)]
pub struct Config {
    pub cluster_id: String,
    pub idc: String,
    pub retain_interval_s: u64,
    pub default_alloc_vols_num: u32,
    pub init_volume_num: u32,
    pub total_threshold_ratio: f64,
    pub metric_report_interval_s: u64,
}

impl Config {
    /// Construct a config with the documented defaults:
    /// `retain_interval_s = 40`, `default_alloc_vols_num = 1`,
    /// `init_volume_num = 4`, `total_threshold_ratio = 0.6`,
    /// `metric_report_interval_s = 60`.
    pub fn new(cluster_id: impl Into<String>, idc: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            idc: idc.into(),
            retain_interval_s: 40,
            default_alloc_vols_num: 1,
            init_volume_num: 4,
            total_threshold_ratio: 0.6,
            metric_report_interval_s: 60,
        }
    }

    pub fn with_retain_interval_s(mut self, v: u64) -> Self {
        self.retain_interval_s = v;
        self
    }

    pub fn with_default_alloc_vols_num(mut self, v: u32) -> Self {
        self.default_alloc_vols_num = v;
        self
    }

    pub fn with_init_volume_num(mut self, v: u32) -> Self {
        self.init_volume_num = v;
        self
    }

    pub fn with_total_threshold_ratio(mut self, v: f64) -> Self {
        self.total_threshold_ratio = v;
        self
    }

    pub fn with_metric_report_interval_s(mut self, v: u64) -> Self {
        self.metric_report_interval_s = v;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::new("cluster-a", "idc-1");
        assert_eq!(cfg.retain_interval_s, 40);
        assert_eq!(cfg.default_alloc_vols_num, 1);
        assert_eq!(cfg.init_volume_num, 4);
        assert_eq!(cfg.total_threshold_ratio, 0.6);
        assert_eq!(cfg.metric_report_interval_s, 60);
    }

    #[test]
    fn builders_override_defaults() {
        let cfg = Config::new("cluster-a", "idc-1")
            .with_retain_interval_s(10)
            .with_init_volume_num(8);
        assert_eq!(cfg.retain_interval_s, 10);
        assert_eq!(cfg.init_volume_num, 8);
        assert_eq!(cfg.default_alloc_vols_num, 1);
    }
}
