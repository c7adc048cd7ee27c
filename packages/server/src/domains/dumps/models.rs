//! Dump model. Dumps are written once at capture and never modified;
//! provenance references point back at them forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::{BasketId, DumpId, WorkspaceId};

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct RawDump {
    pub id: DumpId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub body_text: String,
    pub source_meta: serde_json::Value,
    /// Correlates the capture call with downstream pipeline work.
    pub ingest_trace_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct NewDump {
    #[builder(default = DumpId::new())]
    pub id: DumpId,
    pub basket_id: BasketId,
    pub workspace_id: WorkspaceId,
    pub body_text: String,
    #[builder(default = serde_json::Value::Null)]
    pub source_meta: serde_json::Value,
    pub ingest_trace_id: String,
}
