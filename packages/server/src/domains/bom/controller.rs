//! BOM change control over the state-machine engine.
//!
//! The controller holds no state of its own: the bom machine decides which
//! transitions are legal (including the frozen/released fork), and this
//! layer adds draft handling, diff computation, ECN numbering, and the
//! atomic draft application on approval. `boms.status` mirrors the
//! committed machine state after each fire.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use ratchet::{ActorKind, CancellationToken, Engine, FireRequest, TransitionRecord};
use serde_json::{json, Value};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::diff::diff_items;
use super::models::{ecn_status, status, Bom, BomDraft, BomEcn, BomItem, BomItemData, DraftData};
use crate::common::AppError;

/// Machine name and entity kind for BOMs.
pub const BOM_KIND: &str = "bom";

/// Attempts for ECN-number allocation races before giving up with Conflict.
const ECN_ALLOC_ATTEMPTS: u32 = 3;

pub struct BomChangeController {
    pool: PgPool,
    engine: Arc<Engine>,
}

impl BomChangeController {
    pub fn new(pool: PgPool, engine: Arc<Engine>) -> Self {
        Self { pool, engine }
    }

    async fn load(&self, bom_id: Uuid) -> Result<Bom, AppError> {
        Bom::find_by_id(bom_id, &self.pool)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| AppError::NotFound(format!("BOM {bom_id} not found")))
    }

    async fn fire(
        &self,
        bom: &Bom,
        event: &str,
        mut ctx: Value,
        actor_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TransitionRecord, AppError> {
        // Every bom firing carries the frozen flag so the guard pairs can
        // pick the right return state.
        if let Some(map) = ctx.as_object_mut() {
            map.insert("was_frozen".to_string(), json!(bom.was_frozen()));
        }
        let entity_id = bom.id.to_string();
        let record = self
            .engine
            .fire(
                FireRequest {
                    entity_kind: BOM_KIND,
                    entity_id: &entity_id,
                    event,
                    ctx,
                    actor_id,
                    actor_kind: ActorKind::User,
                    // BOMs reach change control mid-life (created and
                    // released by the catalog surface); the row status
                    // seeds the machine on first contact.
                    fallback_state: Some(&bom.status),
                },
                cancel,
            )
            .await?;
        Ok(record)
    }

    /// Open a released (or frozen) BOM for editing.
    pub async fn start_edit(
        &self,
        bom_id: Uuid,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<Bom, AppError> {
        let bom = self.load(bom_id).await?;
        let record = self.fire(&bom, "start_edit", json!({}), operator, cancel).await?;
        Bom::set_status(bom_id, &record.to_state, &self.pool)
            .await
            .map_err(AppError::internal)
    }

    /// Save (or replace) the working draft. A BOM still sitting in
    /// released/frozen is moved into editing first, the way a save from the
    /// editor implies the edit session.
    pub async fn save_draft(
        &self,
        bom_id: Uuid,
        draft: DraftData,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<BomDraft, AppError> {
        let mut bom = self.load(bom_id).await?;

        if bom.status == status::RELEASED || bom.status == status::FROZEN {
            let record = self.fire(&bom, "start_edit", json!({}), operator, cancel).await?;
            bom = Bom::set_status(bom_id, &record.to_state, &self.pool)
                .await
                .map_err(AppError::internal)?;
        }

        // Self-loop validates the edit session and keeps the audit trail
        // aware of draft activity; it fires before the draft is written so
        // an ineligible BOM never grows a stray draft row.
        self.fire(
            &bom,
            "save_draft",
            json!({"item_count": draft.items.len()}),
            operator,
            cancel,
        )
        .await?;

        let draft_value = serde_json::to_value(&draft)?;
        BomDraft::upsert(bom_id, &draft_value, operator, &self.pool)
            .await
            .map_err(AppError::internal)
    }

    pub async fn get_draft(&self, bom_id: Uuid) -> Result<Option<BomDraft>, AppError> {
        self.load(bom_id).await?;
        BomDraft::find_by_bom(bom_id, &self.pool)
            .await
            .map_err(AppError::internal)
    }

    /// Abandon the edit session: drop the draft, return to released (or
    /// frozen).
    pub async fn discard_draft(
        &self,
        bom_id: Uuid,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<Bom, AppError> {
        let bom = self.load(bom_id).await?;
        let record = self.fire(&bom, "discard_draft", json!({}), operator, cancel).await?;
        BomDraft::delete(bom_id, &self.pool)
            .await
            .map_err(AppError::internal)?;
        Bom::set_status(bom_id, &record.to_state, &self.pool)
            .await
            .map_err(AppError::internal)
    }

    /// Submit the draft as an engineering change notice.
    ///
    /// Computes the three-bucket diff against the live items, allocates the
    /// next `ECN-YYYY-NNNN` (retrying allocation races on the unique
    /// index), persists the ECN, and moves the BOM to `ecn_pending`.
    pub async fn submit_ecn(
        &self,
        bom_id: Uuid,
        title: &str,
        operator: &str,
        cancel: &CancellationToken,
    ) -> Result<BomEcn, AppError> {
        if title.trim().is_empty() {
            return Err(AppError::InvalidInput("ECN title must not be empty".into()));
        }
        let bom = self.load(bom_id).await?;
        if bom.status != status::EDITING {
            return Err(AppError::PreconditionFailed(format!(
                "BOM must be editing to submit an ECN (currently {})",
                bom.status
            )));
        }

        let draft = BomDraft::find_by_bom(bom_id, &self.pool)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| {
                AppError::PreconditionFailed("no draft exists for this BOM".to_string())
            })?;
        let draft_data = draft.parse().map_err(AppError::internal)?;

        let current: Vec<BomItemData> = BomItem::for_bom(bom_id, &self.pool)
            .await
            .map_err(AppError::internal)?
            .into_iter()
            .map(Into::into)
            .collect();
        let summary = diff_items(&current, &draft_data.items);
        let summary_value = serde_json::to_value(&summary)?;

        let ecn = self
            .allocate_and_insert_ecn(&bom, title, &summary_value, operator)
            .await?;

        self.fire(
            &bom,
            "submit_ecn",
            json!({"draft_exists": true, "ecn_number": ecn.ecn_number, "title": title}),
            operator,
            cancel,
        )
        .await?;
        Bom::set_status(bom_id, status::ECN_PENDING, &self.pool)
            .await
            .map_err(AppError::internal)?;

        info!(bom_id = %bom_id, ecn_number = %ecn.ecn_number, "ECN submitted");
        Ok(ecn)
    }

    /// Approve a pending ECN: apply the draft atomically, bump the minor
    /// version, drop the draft, return the BOM to released (or frozen).
    /// The major version is only ever bumped externally.
    pub async fn approve_ecn(
        &self,
        ecn_id: Uuid,
        approver: &str,
        cancel: &CancellationToken,
    ) -> Result<BomEcn, AppError> {
        let ecn = self.load_pending_ecn(ecn_id).await?;
        let bom = self.load(ecn.bom_id).await?;

        let record = self
            .fire(
                &bom,
                "approve_ecn",
                json!({"ecn_number": ecn.ecn_number}),
                approver,
                cancel,
            )
            .await?;

        let draft_data = match BomDraft::find_by_bom(bom.id, &self.pool)
            .await
            .map_err(AppError::internal)?
        {
            Some(draft) => Some(draft.parse().map_err(AppError::internal)?),
            None => {
                // Approval without a surviving draft still versions the BOM;
                // the change summary remains the record of intent.
                warn!(bom_id = %bom.id, ecn = %ecn.ecn_number, "approving ECN with no draft row");
                None
            }
        };

        let ecn = self
            .apply_approval(&bom, &ecn, draft_data, &record.to_state, approver)
            .await?;
        info!(bom_id = %bom.id, ecn_number = %ecn.ecn_number, "ECN approved");
        Ok(ecn)
    }

    /// Reject a pending ECN. The draft is preserved so the author can
    /// revise and resubmit.
    pub async fn reject_ecn(
        &self,
        ecn_id: Uuid,
        rejecter: &str,
        note: &str,
        cancel: &CancellationToken,
    ) -> Result<BomEcn, AppError> {
        let ecn = self.load_pending_ecn(ecn_id).await?;
        let bom = self.load(ecn.bom_id).await?;

        let record = self
            .fire(
                &bom,
                "reject_ecn",
                json!({"ecn_number": ecn.ecn_number, "note": note}),
                rejecter,
                cancel,
            )
            .await?;

        let ecn: BomEcn = sqlx::query_as(
            "UPDATE bom_ecns
             SET status = 'rejected', rejected_by = $2, rejected_at = NOW(),
                 rejection_note = $3, updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(ecn_id)
        .bind(rejecter)
        .bind(note)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::internal)?;

        Bom::set_status(bom.id, &record.to_state, &self.pool)
            .await
            .map_err(AppError::internal)?;
        Ok(ecn)
    }

    pub async fn get_ecn(&self, ecn_id: Uuid) -> Result<BomEcn, AppError> {
        BomEcn::find_by_id(ecn_id, &self.pool)
            .await
            .map_err(AppError::internal)?
            .ok_or_else(|| AppError::NotFound(format!("ECN {ecn_id} not found")))
    }

    pub async fn list_ecns(
        &self,
        bom_id: Uuid,
        status: Option<&str>,
    ) -> Result<Vec<BomEcn>, AppError> {
        self.load(bom_id).await?;
        BomEcn::list_for_bom(bom_id, status, &self.pool)
            .await
            .map_err(AppError::internal)
    }

    pub async fn history(&self, bom_id: Uuid) -> Result<Vec<TransitionRecord>, AppError> {
        self.load(bom_id).await?;
        let records = self.engine.history(BOM_KIND, &bom_id.to_string()).await?;
        Ok(records)
    }

    async fn load_pending_ecn(&self, ecn_id: Uuid) -> Result<BomEcn, AppError> {
        let ecn = self.get_ecn(ecn_id).await?;
        if ecn.status != ecn_status::PENDING {
            return Err(AppError::PreconditionFailed(format!(
                "ECN {} is already {}",
                ecn.ecn_number, ecn.status
            )));
        }
        Ok(ecn)
    }

    /// Allocate the next number for this calendar year and insert. Races on
    /// the unique index resolve by recomputing and retrying.
    async fn allocate_and_insert_ecn(
        &self,
        bom: &Bom,
        title: &str,
        summary: &Value,
        operator: &str,
    ) -> Result<BomEcn, AppError> {
        let year = Utc::now().year();
        let description = format!("BOM change request: {}", bom.name);

        for _ in 0..ECN_ALLOC_ATTEMPTS {
            let next = BomEcn::max_sequence_for_year(year, &self.pool)
                .await
                .map_err(AppError::internal)?
                + 1;
            let number = BomEcn::render_number(year, next);

            match BomEcn::insert_pending(
                &number,
                bom.id,
                title,
                &description,
                summary,
                operator,
                &self.pool,
            )
            .await
            {
                Ok(ecn) => return Ok(ecn),
                Err(err) if is_unique_violation(&err) => {
                    warn!(ecn_number = %number, "ECN number taken concurrently, retrying");
                    continue;
                }
                Err(err) => return Err(AppError::internal(err)),
            }
        }

        Err(AppError::Conflict(format!(
            "could not allocate an ECN number after {ECN_ALLOC_ATTEMPTS} attempts"
        )))
    }

    /// Everything ECN approval writes to the domain tables, in one
    /// transaction: item replacement, header updates, version bump, ECN
    /// status, draft removal.
    async fn apply_approval(
        &self,
        bom: &Bom,
        ecn: &BomEcn,
        draft: Option<DraftData>,
        to_state: &str,
        approver: &str,
    ) -> Result<BomEcn, AppError> {
        let mut tx = self.pool.begin().await.map_err(AppError::internal)?;

        let mut name = bom.name.clone();
        let mut description = bom.description.clone();
        let mut total_items = bom.total_items;

        if let Some(draft) = draft {
            if let Some(draft_name) = draft.name.filter(|n| !n.is_empty()) {
                name = draft_name;
            }
            if let Some(draft_description) = draft.description.filter(|d| !d.is_empty()) {
                description = draft_description;
            }

            sqlx::query("DELETE FROM bom_items WHERE bom_id = $1")
                .bind(bom.id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::internal)?;

            for item in &draft.items {
                sqlx::query(
                    "INSERT INTO bom_items
                         (id, bom_id, name, quantity, unit, supplier, reference, remark)
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(item.id)
                .bind(bom.id)
                .bind(&item.name)
                .bind(item.quantity)
                .bind(&item.unit)
                .bind(&item.supplier)
                .bind(&item.reference)
                .bind(&item.remark)
                .execute(&mut *tx)
                .await
                .map_err(AppError::internal)?;
            }
            total_items = draft.items.len() as i32;

            sqlx::query("DELETE FROM bom_drafts WHERE bom_id = $1")
                .bind(bom.id)
                .execute(&mut *tx)
                .await
                .map_err(AppError::internal)?;
        }

        let minor = bom.version_minor + 1;
        sqlx::query(
            "UPDATE boms
             SET name = $2, description = $3, status = $4, version = $5,
                 version_minor = $6, total_items = $7, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(bom.id)
        .bind(&name)
        .bind(&description)
        .bind(to_state)
        .bind(Bom::render_version(bom.version_major, minor))
        .bind(minor)
        .bind(total_items)
        .execute(&mut *tx)
        .await
        .map_err(AppError::internal)?;

        let ecn: BomEcn = sqlx::query_as(
            "UPDATE bom_ecns
             SET status = 'approved', approved_by = $2, approved_at = NOW(), updated_at = NOW()
             WHERE id = $1 RETURNING *",
        )
        .bind(ecn.id)
        .bind(approver)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::internal)?;

        tx.commit().await.map_err(AppError::internal)?;
        Ok(ecn)
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}
