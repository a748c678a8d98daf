use crate::metrics::definitions::{
    HELP_CYCLE_DURATION_SECONDS, HELP_LAG, HELP_UP, METRIC_CYCLE_DURATION_SECONDS, METRIC_LAG,
    METRIC_UP,
};
use crate::metrics::registry::MetricsRegistry;
use std::fmt::Write;
use std::sync::Arc;

/// Renders the registry in the Prometheus text exposition format.
#[derive(Clone)]
pub struct PrometheusExporter {
    registry: Arc<MetricsRegistry>,
}

impl PrometheusExporter {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn render_metrics(&self) -> String {
        let mut output = String::new();

        let records = self.registry.records();
        if !records.is_empty() {
            write_header(&mut output, METRIC_LAG, HELP_LAG);
            for record in &records {
                let _ = writeln!(output, "{record}");
            }
        }

        write_header(&mut output, METRIC_UP, HELP_UP);
        let _ = writeln!(
            output,
            "{METRIC_UP} {}",
            u8::from(self.registry.is_healthy())
        );

        write_header(
            &mut output,
            METRIC_CYCLE_DURATION_SECONDS,
            HELP_CYCLE_DURATION_SECONDS,
        );
        let _ = writeln!(
            output,
            "{METRIC_CYCLE_DURATION_SECONDS} {}",
            self.registry.cycle_duration_seconds()
        );

        output
    }
}

fn write_header(output: &mut String, name: &str, help: &str) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
}
