use crate::config::PushConfig;
use crate::error::{LagError, Result};
use crate::export::MetricSink;
use crate::metrics::types::LagBatch;
use tracing::{debug, instrument};

/// Pushes lag lines to a Prometheus text import endpoint such as
/// VictoriaMetrics' `/api/v1/import/prometheus`. Failed deliveries are
/// reported, not retried; the next cycle sends fresh values anyway.
pub struct RemoteWriteSink {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteWriteSink {
    pub fn new(config: &PushConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }
}

#[async_trait::async_trait]
impl MetricSink for RemoteWriteSink {
    fn name(&self) -> &'static str {
        "remote_write"
    }

    #[instrument(skip(self, batch), fields(cluster = %batch.cluster, group = %batch.group))]
    async fn emit(&self, batch: &LagBatch) -> Result<()> {
        if batch.records.is_empty() {
            return Ok(());
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(batch.render_lines())
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(LagError::Delivery(format!(
                "{} responded with {status}: {}",
                self.endpoint,
                detail.trim()
            )));
        }

        debug!(records = batch.records.len(), "Pushed lag records");
        Ok(())
    }
}
