// Audit Exporter: persists the run's provenance record as JSON

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use super::{Outcome, Stage, AUDIT};
use crate::backends::PersistenceSink;
use crate::error::PipelineError;
use crate::models::AuditRecord;

pub fn audit_key(record: &AuditRecord) -> String {
    format!("audit-{}.json", record.run_id())
}

pub struct AuditExporter {
    sink: Arc<dyn PersistenceSink>,
}

impl AuditExporter {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Stage for AuditExporter {
    type Input = AuditRecord;
    type Output = String;

    fn name(&self) -> &'static str {
        AUDIT
    }

    async fn run(&self, record: AuditRecord) -> Result<Outcome<String>, PipelineError> {
        let body = serde_json::to_vec_pretty(&record)?;
        let locator = self.sink.persist(&audit_key(&record), &body).await?;
        info!(%locator, entries = record.entries().len(), "Audit: record persisted");
        Ok(Outcome::ok(locator))
    }

    fn audit_view(&self, locator: &String) -> Value {
        json!({ "location": locator })
    }

    fn writes_artifacts(&self) -> bool {
        true
    }
}
