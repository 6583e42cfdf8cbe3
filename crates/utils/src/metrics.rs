use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

pub const STEP_CONNECTION: &str = "connection";
pub const STEP_AUTH: &str = "auth";
pub const STEP_DATA: &str = "data";
pub const STEP_DELIVERY: &str = "delivery";

/// Counters of the relay, kept in a private registry so that several
/// instances can live in one process.
pub struct RelayMetrics {
    registry: Registry,
    errors: IntCounterVec,
}

impl RelayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let errors = IntCounterVec::new(
            Opts::new("errors", "Collects errors in execution"),
            &["step"],
        )?;
        registry.register(Box::new(errors.clone()))?;
        Ok(Self { registry, errors })
    }

    /// Counts a failure of the given processing step.
    pub fn error(&self, step: &str) {
        self.errors.with_label_values(&[step]).inc();
    }

    pub fn errors(&self, step: &str) -> u64 {
        self.errors.with_label_values(&[step]).get()
    }

    /// Encodes every metric in the Prometheus text format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_counter() {
        let metrics = RelayMetrics::new().unwrap();
        metrics.error(STEP_DELIVERY);
        metrics.error(STEP_DELIVERY);
        metrics.error(STEP_AUTH);

        assert_eq!(metrics.errors(STEP_DELIVERY), 2);
        assert_eq!(metrics.errors(STEP_AUTH), 1);
        assert_eq!(metrics.errors(STEP_DATA), 0);

        let text = metrics.render().unwrap();
        assert!(text.contains("# TYPE errors counter"));
        assert!(text.contains("errors{step=\"delivery\"} 2"));
    }
}
