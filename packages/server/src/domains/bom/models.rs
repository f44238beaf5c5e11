//! BOM persistence layer: header, items, working draft, and ECNs.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

/// BOM status values, matching the bom machine's states.
pub mod status {
    pub const DRAFT: &str = "draft";
    pub const SUBMITTED: &str = "submitted";
    pub const RELEASED: &str = "released";
    pub const EDITING: &str = "editing";
    pub const ECN_PENDING: &str = "ecn_pending";
    pub const FROZEN: &str = "frozen";
    pub const REJECTED: &str = "rejected";
}

/// ECN status values.
pub mod ecn_status {
    pub const PENDING: &str = "pending";
    pub const APPROVED: &str = "approved";
    pub const REJECTED: &str = "rejected";
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct Bom {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: String,
    pub version: String,
    pub version_major: i32,
    pub version_minor: i32,
    pub total_items: i32,
    pub frozen_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bom {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM boms WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO boms (id, name, description, status, version, version_major,
                               version_minor, total_items, frozen_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             RETURNING *",
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.description)
        .bind(&self.status)
        .bind(&self.version)
        .bind(self.version_major)
        .bind(self.version_minor)
        .bind(self.total_items)
        .bind(self.frozen_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_status(id: Uuid, status: &str, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "UPDATE boms SET status = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(status)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Whether this BOM returns to `frozen` rather than `released` when it
    /// leaves the editing flow.
    pub fn was_frozen(&self) -> bool {
        self.frozen_at.is_some()
    }

    /// Human-readable version string for a major/minor pair.
    pub fn render_version(major: i32, minor: i32) -> String {
        format!("v{major}.{minor}")
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BomItem {
    pub id: Uuid,
    pub bom_id: Uuid,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    pub supplier: String,
    pub reference: String,
    pub remark: String,
    pub updated_at: DateTime<Utc>,
}

impl BomItem {
    pub async fn for_bom(bom_id: Uuid, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM bom_items WHERE bom_id = $1 ORDER BY name")
            .bind(bom_id)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO bom_items (id, bom_id, name, quantity, unit, supplier, reference, remark)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(self.id)
        .bind(self.bom_id)
        .bind(&self.name)
        .bind(self.quantity)
        .bind(&self.unit)
        .bind(&self.supplier)
        .bind(&self.reference)
        .bind(&self.remark)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }
}

/// An item as carried in draft JSON and diff summaries. Identity is `id`;
/// the modification tuple is `name, quantity, unit, supplier` — the other
/// fields are carried through without marking the item modified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BomItemData {
    pub id: Uuid,
    pub name: String,
    pub quantity: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub supplier: String,
    #[serde(default)]
    pub reference: String,
    #[serde(default)]
    pub remark: String,
}

impl From<BomItem> for BomItemData {
    fn from(item: BomItem) -> Self {
        Self {
            id: item.id,
            name: item.name,
            quantity: item.quantity,
            unit: item.unit,
            supplier: item.supplier,
            reference: item.reference,
            remark: item.remark,
        }
    }
}

/// Contents of `bom_drafts.draft_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftData {
    #[serde(default)]
    pub items: Vec<BomItemData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BomDraft {
    pub id: Uuid,
    pub bom_id: Uuid,
    pub draft_data: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BomDraft {
    pub async fn find_by_bom(bom_id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM bom_drafts WHERE bom_id = $1")
            .bind(bom_id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// One working draft per BOM: insert or replace.
    pub async fn upsert(bom_id: Uuid, draft_data: &Value, user: &str, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO bom_drafts (bom_id, draft_data, created_by)
             VALUES ($1, $2, $3)
             ON CONFLICT (bom_id) DO UPDATE
                 SET draft_data = EXCLUDED.draft_data,
                     created_by = EXCLUDED.created_by,
                     updated_at = NOW()
             RETURNING *",
        )
        .bind(bom_id)
        .bind(draft_data)
        .bind(user)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn delete(bom_id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query("DELETE FROM bom_drafts WHERE bom_id = $1")
            .bind(bom_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub fn parse(&self) -> Result<DraftData> {
        serde_json::from_value(self.draft_data.clone()).map_err(Into::into)
    }
}

#[derive(sqlx::FromRow, Debug, Clone)]
pub struct BomEcn {
    pub id: Uuid,
    pub ecn_number: String,
    pub bom_id: Uuid,
    pub title: String,
    pub description: String,
    pub change_summary: Value,
    pub status: String,
    pub created_by: String,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejected_by: Option<String>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub rejection_note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BomEcn {
    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM bom_ecns WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list_for_bom(bom_id: Uuid, status: Option<&str>, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM bom_ecns
             WHERE bom_id = $1 AND ($2::text IS NULL OR status = $2)
             ORDER BY created_at DESC",
        )
        .bind(bom_id)
        .bind(status)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Highest sequence number already allocated for the given year.
    pub async fn max_sequence_for_year(year: i32, pool: &PgPool) -> Result<i32> {
        let prefix = format!("ECN-{year}-%");
        let max: Option<String> = sqlx::query_scalar(
            "SELECT MAX(ecn_number) FROM bom_ecns WHERE ecn_number LIKE $1",
        )
        .bind(&prefix)
        .fetch_one(pool)
        .await?;
        Ok(max
            .and_then(|n| n.rsplit('-').next().and_then(|s| s.parse().ok()))
            .unwrap_or(0))
    }

    /// Insert a pending ECN. Fails with a unique violation if the number was
    /// taken concurrently; the controller retries with a fresh number.
    pub async fn insert_pending(
        ecn_number: &str,
        bom_id: Uuid,
        title: &str,
        description: &str,
        change_summary: &Value,
        created_by: &str,
        pool: &PgPool,
    ) -> Result<Self, sqlx::Error> {
        sqlx::query_as::<_, Self>(
            "INSERT INTO bom_ecns (ecn_number, bom_id, title, description, change_summary,
                                   status, created_by)
             VALUES ($1, $2, $3, $4, $5, 'pending', $6)
             RETURNING *",
        )
        .bind(ecn_number)
        .bind(bom_id)
        .bind(title)
        .bind(description)
        .bind(change_summary)
        .bind(created_by)
        .fetch_one(pool)
        .await
    }

    /// Render an ECN number for a year and sequence: `ECN-YYYY-NNNN`.
    pub fn render_number(year: i32, sequence: i32) -> String {
        format!("ECN-{year}-{sequence:04}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_render_version() {
        assert_eq!(Bom::render_version(1, 0), "v1.0");
        assert_eq!(Bom::render_version(2, 13), "v2.13");
    }

    #[test]
    fn test_render_ecn_number_zero_padded() {
        assert_eq!(BomEcn::render_number(2026, 1), "ECN-2026-0001");
        assert_eq!(BomEcn::render_number(2026, 42), "ECN-2026-0042");
        assert_eq!(BomEcn::render_number(2026, 12345), "ECN-2026-12345");
    }

    #[test]
    fn test_draft_data_tolerates_partial_payloads() {
        let parsed: DraftData = serde_json::from_value(json!({
            "items": [{"id": Uuid::new_v4(), "name": "bolt", "quantity": 4}]
        }))
        .unwrap();
        assert_eq!(parsed.items.len(), 1);
        assert_eq!(parsed.items[0].unit, "");
        assert!(parsed.name.is_none());

        let empty: DraftData = serde_json::from_value(json!({})).unwrap();
        assert!(empty.items.is_empty());
    }
}
