pub const METRIC_LAG: &str = "lag";
pub const METRIC_UP: &str = "kafka_lag_exporter_up";
pub const METRIC_CYCLE_DURATION_SECONDS: &str = "kafka_lag_exporter_cycle_duration_seconds";

pub const LABEL_NAMESPACE: &str = "namespace";
pub const LABEL_CONSUMER_GROUP: &str = "consumer_group";
pub const LABEL_TOPIC: &str = "topic";

pub const HELP_LAG: &str =
    "Sum over the group's assigned partitions of newest offset minus committed offset, per topic";
pub const HELP_UP: &str = "1 if the exporter is healthy, 0 otherwise";
pub const HELP_CYCLE_DURATION_SECONDS: &str = "Duration of the last measurement cycle in seconds";
