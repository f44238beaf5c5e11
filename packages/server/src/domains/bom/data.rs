use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::models::{Bom, BomDraft, BomEcn};

/// BOM API representation
#[derive(Debug, Clone, Serialize)]
pub struct BomData {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: String,
    pub version: String,
    pub total_items: i32,
    pub frozen_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<Bom> for BomData {
    fn from(bom: Bom) -> Self {
        Self {
            id: bom.id,
            name: bom.name,
            description: bom.description,
            status: bom.status,
            version: bom.version,
            total_items: bom.total_items,
            frozen_at: bom.frozen_at,
            updated_at: bom.updated_at,
        }
    }
}

/// Draft API representation
#[derive(Debug, Clone, Serialize)]
pub struct DraftResponse {
    pub bom_id: Uuid,
    pub draft_data: Value,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
}

impl From<BomDraft> for DraftResponse {
    fn from(draft: BomDraft) -> Self {
        Self {
            bom_id: draft.bom_id,
            draft_data: draft.draft_data,
            created_by: draft.created_by,
            updated_at: draft.updated_at,
        }
    }
}

/// ECN API representation
#[derive(Debug, Clone, Serialize)]
pub struct EcnData {
    pub id: Uuid,
    pub ecn_number: String,
    pub bom_id: Uuid,
    pub title: String,
    pub description: String,
    pub change_summary: Value,
    pub status: String,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub rejected_by: Option<String>,
    pub rejection_note: String,
    pub created_at: DateTime<Utc>,
}

impl From<BomEcn> for EcnData {
    fn from(ecn: BomEcn) -> Self {
        Self {
            id: ecn.id,
            ecn_number: ecn.ecn_number,
            bom_id: ecn.bom_id,
            title: ecn.title,
            description: ecn.description,
            change_summary: ecn.change_summary,
            status: ecn.status,
            created_by: ecn.created_by,
            approved_by: ecn.approved_by,
            rejected_by: ecn.rejected_by,
            rejection_note: ecn.rejection_note,
            created_at: ecn.created_at,
        }
    }
}
