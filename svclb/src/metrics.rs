use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub tables: TableMetrics,
    pub registry: Arc<Registry>,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("svclb");
        let tables = TableMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            tables,
        }
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TableName {
    Service,
    Backend,
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TableOp {
    Upsert,
    Delete,
    Rollback,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct WriteLabels {
    pub table: TableName,
    pub op: TableOp,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TableLabels {
    pub table: TableName,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FailureLabels {
    pub table: TableName,
    pub error: String,
}

/// Counters for writes the table manager issues against the maps.
#[derive(Clone, Default)]
pub struct TableMetrics {
    pub writes: Family<WriteLabels, Counter>,
    pub failures: Family<FailureLabels, Counter>,
    pub entries: Family<TableLabels, Gauge>,
}

impl TableMetrics {
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "table_writes",
            "Number of entries written to or deleted from the lb tables",
            self.writes.clone(),
        );
        registry.register(
            "table_write_failures",
            "Number of rejected or failed table operations",
            self.failures.clone(),
        );
        registry.register(
            "table_entries",
            "Number of entries currently in the lb tables",
            self.entries.clone(),
        );
        self
    }

    pub fn count_write(&self, table: TableName, op: TableOp, entries: usize) {
        self.writes
            .get_or_create(&WriteLabels { table, op })
            .inc_by(entries as u64);
    }

    pub fn set_entries(&self, table: TableName, entries: usize) {
        self.entries
            .get_or_create(&TableLabels { table })
            .set(i64::try_from(entries).unwrap_or(i64::MAX));
    }

    pub fn count_failure(&self, table: TableName, e: &Error) {
        self.failures
            .get_or_create(&FailureLabels {
                table,
                error: e.metric_label(),
            })
            .inc();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode_table_metrics() {
        let metrics = Metrics::default();
        metrics
            .tables
            .count_write(TableName::Service, TableOp::Upsert, 3);
        metrics
            .tables
            .count_failure(TableName::Backend, &Error::BackendNotFound(7));
        metrics.tables.set_entries(TableName::Backend, 12);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &metrics.registry).unwrap();
        assert!(buffer.contains("svclb_table_writes_total{table=\"Service\",op=\"Upsert\"} 3"));
        assert!(buffer.contains("error=\"backendnotfound\""));
        assert!(buffer.contains("svclb_table_entries{table=\"Backend\"} 12"));
    }
}
