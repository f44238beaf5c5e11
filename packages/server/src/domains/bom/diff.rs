//! ECN diff computation.
//!
//! Compares a BOM's live items against a draft's items. Identity is the
//! item id; modification is detected on the `name, quantity, unit, supplier`
//! tuple — other fields carry through without marking an item modified.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use super::models::BomItemData;

#[derive(Debug, Clone, Serialize)]
pub struct ItemDiff {
    pub id: Uuid,
    pub before: BomItemData,
    pub after: BomItemData,
    /// Which tracked fields changed, in `name, quantity, unit, supplier`
    /// order.
    pub changes: Vec<String>,
}

/// Persisted as `bom_ecns.change_summary`.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeSummary {
    pub added: Vec<BomItemData>,
    pub removed: Vec<BomItemData>,
    pub modified: Vec<ItemDiff>,
}

impl ChangeSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

fn tracked_changes(before: &BomItemData, after: &BomItemData) -> Vec<String> {
    let mut changes = Vec::new();
    if before.name != after.name {
        changes.push("name".to_string());
    }
    if before.quantity != after.quantity {
        changes.push("quantity".to_string());
    }
    if before.unit != after.unit {
        changes.push("unit".to_string());
    }
    if before.supplier != after.supplier {
        changes.push("supplier".to_string());
    }
    changes
}

/// Three-bucket diff between the live item set and the draft.
///
/// Buckets preserve input order: `added` and `modified` follow the draft,
/// `removed` follows the original.
pub fn diff_items(original: &[BomItemData], draft: &[BomItemData]) -> ChangeSummary {
    let original_by_id: HashMap<Uuid, &BomItemData> =
        original.iter().map(|item| (item.id, item)).collect();
    let draft_by_id: HashMap<Uuid, &BomItemData> =
        draft.iter().map(|item| (item.id, item)).collect();

    let mut summary = ChangeSummary {
        added: Vec::new(),
        removed: Vec::new(),
        modified: Vec::new(),
    };

    for item in draft {
        match original_by_id.get(&item.id) {
            None => summary.added.push(item.clone()),
            Some(before) => {
                let changes = tracked_changes(before, item);
                if !changes.is_empty() {
                    summary.modified.push(ItemDiff {
                        id: item.id,
                        before: (*before).clone(),
                        after: item.clone(),
                        changes,
                    });
                }
            }
        }
    }

    for item in original {
        if !draft_by_id.contains_key(&item.id) {
            summary.removed.push(item.clone());
        }
    }

    summary
}
