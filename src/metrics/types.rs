use crate::metrics::definitions::{LABEL_CONSUMER_GROUP, LABEL_NAMESPACE, LABEL_TOPIC, METRIC_LAG};
use std::fmt;
use std::time::Instant;

/// Accumulated lag of one consumer group on one topic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricRecord {
    pub cluster: String,
    pub group: String,
    pub topic: String,
    pub lag: i64,
}

impl MetricRecord {
    pub fn new(
        cluster: impl Into<String>,
        group: impl Into<String>,
        topic: impl Into<String>,
        lag: i64,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            group: group.into(),
            topic: topic.into(),
            lag,
        }
    }
}

/// Renders the exposition line, e.g.
/// `lag{namespace="prod", consumer_group="billing", topic="orders"} 10`.
impl fmt::Display for MetricRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{METRIC_LAG}{{{LABEL_NAMESPACE}=\"{}\", {LABEL_CONSUMER_GROUP}=\"{}\", \
             {LABEL_TOPIC}=\"{}\"}} {}",
            escape_label_value(&self.cluster),
            escape_label_value(&self.group),
            escape_label_value(&self.topic),
            self.lag
        )
    }
}

/// Everything one group task produced in a cycle. An empty `records` list
/// still marks the group as measured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagBatch {
    pub cluster: String,
    pub group: String,
    pub records: Vec<MetricRecord>,
    /// Start of the cycle that measured the group.
    pub cycle_started: Instant,
}

impl LagBatch {
    pub fn new(
        cluster: impl Into<String>,
        group: impl Into<String>,
        records: Vec<MetricRecord>,
        cycle_started: Instant,
    ) -> Self {
        Self {
            cluster: cluster.into(),
            group: group.into(),
            records,
            cycle_started,
        }
    }

    /// Newline-terminated exposition lines for every record.
    pub fn render_lines(&self) -> String {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&record.to_string());
            out.push('\n');
        }
        out
    }
}

pub fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_strategies::strategies::{arb_cluster_name, arb_group_id, arb_topic};
    use proptest::prelude::*;

    #[test]
    fn test_record_renders_exposition_line() {
        let record = MetricRecord::new("prod", "billing", "orders", 10);
        assert_eq!(
            record.to_string(),
            r#"lag{namespace="prod", consumer_group="billing", topic="orders"} 10"#
        );
    }

    #[test]
    fn test_negative_lag_renders_with_sign() {
        let record = MetricRecord::new("prod", "billing", "orders", -3);
        assert!(record.to_string().ends_with("} -3"));
    }

    #[test]
    fn test_label_values_are_escaped() {
        let record = MetricRecord::new("prod", "odd\"group", "path\\topic\nx", 1);
        assert_eq!(
            record.to_string(),
            r#"lag{namespace="prod", consumer_group="odd\"group", topic="path\\topic\nx"} 1"#
        );
    }

    #[test]
    fn test_batch_renders_one_line_per_record() {
        let batch = LagBatch::new(
            "prod",
            "billing",
            vec![
                MetricRecord::new("prod", "billing", "orders", 1),
                MetricRecord::new("prod", "billing", "refunds", 2),
            ],
            Instant::now(),
        );
        let body = batch.render_lines();
        assert_eq!(body.lines().count(), 2);
        assert!(body.ends_with("} 2\n"));
    }

    proptest! {
        #[test]
        fn prop_plain_names_render_verbatim(
            cluster in arb_cluster_name(),
            group in arb_group_id(),
            topic in arb_topic(),
            lag in any::<i64>(),
        ) {
            let line = MetricRecord::new(cluster.clone(), group.clone(), topic.clone(), lag)
                .to_string();
            let expected_labels = format!(
                "namespace=\"{}\", consumer_group=\"{}\", topic=\"{}\"",
                cluster, group, topic
            );
            let expected_suffix = format!("}} {}", lag);
            prop_assert!(line.contains(&expected_labels));
            prop_assert!(line.ends_with(&expected_suffix));
        }

        #[test]
        fn prop_escaped_values_have_no_raw_newlines_or_quotes(value in ".*") {
            let escaped = escape_label_value(&value);
            prop_assert!(!escaped.contains('\n'));
            // Every quote is preceded by a backslash.
            let bytes = escaped.as_bytes();
            for (i, b) in bytes.iter().enumerate() {
                if *b == b'"' {
                    prop_assert!(i > 0 && bytes[i - 1] == b'\\');
                }
            }
        }
    }
}
