//! Data-integrity surveillance: the invariant catalogue, the cycle runner,
//! and the composite drift score.
//!
//! Each invariant is a predicate over persisted business state; the engine
//! finds counter-examples through the typed [`BusinessData`] queries, feeds
//! failures into the incident manager, and writes one drift sample per cycle.

#![forbid(unsafe_code)]

use aegis_incident::IncidentManager;
use aegis_proto::{
    DriftComponent, DriftScoreSample, InvariantResult, InvariantViolation, Priority,
    ViolationRecord,
};
use aegis_store::{BusinessData, OpsStore, StoreError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Violations persisted per cycle, across all invariants. The engine is a
/// surveillance mechanism, not a bulk audit log.
pub const MAX_PERSISTED_VIOLATIONS: usize = 100;

/// Allowed disagreement between a sale total and a derived sum, in minor
/// units.
pub const AMOUNT_TOLERANCE_MINOR: i64 = 1;

/// Outstanding credit may exceed the limit by this much before it counts.
pub const CREDIT_TOLERANCE_PCT: f64 = 5.0;

// ─── Invariant trait & catalogue ─────────────────────────────────────────────

/// A predicate over persisted business state that must hold at all times.
pub trait Invariant: Send + Sync {
    /// Stable identifier; part of the external contract (weights,
    /// dashboards, incident titles).
    fn name(&self) -> &'static str;

    fn priority(&self) -> Priority;

    fn safe_to_auto_correct(&self) -> bool {
        false
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError>;

    /// Repair action, attempted only when [`Self::safe_to_auto_correct`].
    fn auto_correct(
        &self,
        _data: &dyn BusinessData,
        _violations: &[ViolationRecord],
    ) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct NoNegativeStock;

impl Invariant for NoNegativeStock {
    fn name(&self) -> &'static str {
        "NO_NEGATIVE_STOCK"
    }

    fn priority(&self) -> Priority {
        Priority::P1
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(data
            .negative_stock_rows()?
            .into_iter()
            .map(|row| ViolationRecord {
                entity_id: row.stock_id,
                entity_type: "stock".to_string(),
                shop_id: Some(row.shop_id),
                detail: format!("product {} on-hand {}", row.product_id, row.on_hand),
            })
            .collect())
    }
}

pub struct SaleTotalMatchesLineItems;

impl Invariant for SaleTotalMatchesLineItems {
    fn name(&self) -> &'static str {
        "SALE_TOTAL_MATCHES_LINE_ITEMS"
    }

    fn priority(&self) -> Priority {
        Priority::P1
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(data
            .sale_total_mismatches(AMOUNT_TOLERANCE_MINOR)?
            .into_iter()
            .map(|row| ViolationRecord {
                entity_id: row.sale_id,
                entity_type: "sale".to_string(),
                shop_id: Some(row.shop_id),
                detail: format!("total {} vs line sum {}", row.total, row.derived),
            })
            .collect())
    }
}

pub struct PaymentSumMatchesSaleTotal;

impl Invariant for PaymentSumMatchesSaleTotal {
    fn name(&self) -> &'static str {
        "PAYMENT_SUM_MATCHES_SALE_TOTAL"
    }

    fn priority(&self) -> Priority {
        Priority::P1
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(data
            .payment_sum_mismatches(AMOUNT_TOLERANCE_MINOR)?
            .into_iter()
            .map(|row| ViolationRecord {
                entity_id: row.sale_id,
                entity_type: "sale".to_string(),
                shop_id: Some(row.shop_id),
                detail: format!("total {} vs paid+credit {}", row.total, row.derived),
            })
            .collect())
    }
}

pub struct NoDuplicateInvoices;

impl Invariant for NoDuplicateInvoices {
    fn name(&self) -> &'static str {
        "NO_DUPLICATE_INVOICES"
    }

    fn priority(&self) -> Priority {
        Priority::P1
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(data
            .duplicate_invoice_numbers()?
            .into_iter()
            .map(|row| ViolationRecord {
                entity_id: row.invoice_number.clone(),
                entity_type: "invoice".to_string(),
                shop_id: None,
                detail: format!("invoice number appears {} times", row.occurrences),
            })
            .collect())
    }
}

pub struct StockMovementBalance;

impl Invariant for StockMovementBalance {
    fn name(&self) -> &'static str {
        "STOCK_MOVEMENT_BALANCE"
    }

    fn priority(&self) -> Priority {
        Priority::P2
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(data
            .stock_movement_imbalances()?
            .into_iter()
            .map(|row| ViolationRecord {
                entity_id: row.stock_id,
                entity_type: "stock".to_string(),
                shop_id: Some(row.shop_id),
                detail: format!("on-hand {} vs movement sum {}", row.on_hand, row.movement_sum),
            })
            .collect())
    }
}

pub struct CreditLimitNotExceeded;

impl Invariant for CreditLimitNotExceeded {
    fn name(&self) -> &'static str {
        "CREDIT_LIMIT_NOT_EXCEEDED"
    }

    fn priority(&self) -> Priority {
        Priority::P2
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(data
            .credit_limit_breaches(CREDIT_TOLERANCE_PCT)?
            .into_iter()
            .map(|row| ViolationRecord {
                entity_id: row.customer_id,
                entity_type: "customer".to_string(),
                shop_id: Some(row.shop_id),
                detail: format!("outstanding {} vs limit {}", row.outstanding, row.credit_limit),
            })
            .collect())
    }
}

pub struct NoOrphanedSaleItems;

impl Invariant for NoOrphanedSaleItems {
    fn name(&self) -> &'static str {
        "NO_ORPHANED_SALE_ITEMS"
    }

    fn priority(&self) -> Priority {
        Priority::P3
    }

    fn safe_to_auto_correct(&self) -> bool {
        true
    }

    fn check(&self, data: &dyn BusinessData) -> Result<Vec<ViolationRecord>, StoreError> {
        Ok(data
            .orphaned_sale_items()?
            .into_iter()
            .map(|row| ViolationRecord {
                entity_id: row.sale_item_id,
                entity_type: "sale_item".to_string(),
                shop_id: None,
                detail: format!("references missing sale {}", row.sale_id),
            })
            .collect())
    }

    fn auto_correct(
        &self,
        data: &dyn BusinessData,
        violations: &[ViolationRecord],
    ) -> Result<(), StoreError> {
        let ids: Vec<String> = violations.iter().map(|v| v.entity_id.clone()).collect();
        let deleted = data.delete_sale_items(&ids)?;
        info!(deleted, "deleted orphaned sale items");
        Ok(())
    }
}

/// The catalogue in registration order. Order is part of the cycle contract.
pub fn default_catalogue() -> Vec<Box<dyn Invariant>> {
    vec![
        Box::new(NoNegativeStock),
        Box::new(SaleTotalMatchesLineItems),
        Box::new(PaymentSumMatchesSaleTotal),
        Box::new(NoDuplicateInvoices),
        Box::new(StockMovementBalance),
        Box::new(CreditLimitNotExceeded),
        Box::new(NoOrphanedSaleItems),
    ]
}

// ─── Drift score ─────────────────────────────────────────────────────────────

/// Deduction weights per invariant. Unknown invariants weigh 5.
pub fn invariant_weights() -> HashMap<&'static str, f64> {
    HashMap::from([
        ("NO_NEGATIVE_STOCK", 25.0),
        ("SALE_TOTAL_MATCHES_LINE_ITEMS", 20.0),
        ("PAYMENT_SUM_MATCHES_SALE_TOTAL", 20.0),
        ("NO_DUPLICATE_INVOICES", 15.0),
        ("STOCK_MOVEMENT_BALANCE", 10.0),
        ("CREDIT_LIMIT_NOT_EXCEEDED", 7.0),
        ("NO_ORPHANED_SALE_ITEMS", 3.0),
    ])
}

const DEFAULT_WEIGHT: f64 = 5.0;

/// Composite drift score over one cycle's results. Pure function.
///
/// Each failed invariant deducts `min(weight, weight * log10(count + 1))`:
/// a single rogue row hurts less than a widespread class of violations, and
/// no invariant can deduct more than its weight.
pub fn compute_drift_score(results: &[InvariantResult]) -> u8 {
    let weights = invariant_weights();
    let mut score = 100.0_f64;
    for result in results {
        if result.passed {
            continue;
        }
        let weight = weights
            .get(result.invariant.as_str())
            .copied()
            .unwrap_or(DEFAULT_WEIGHT);
        let count = result.violations.len() as f64;
        let deduction = (weight * (count + 1.0).log10()).min(weight);
        score -= deduction;
    }
    score.max(0.0).round() as u8
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Outcome of one full cycle.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub results: Vec<InvariantResult>,
    pub drift_score: u8,
}

pub struct InvariantEngine {
    catalogue: Vec<Box<dyn Invariant>>,
    store: Arc<OpsStore>,
    incidents: Arc<IncidentManager>,
}

impl InvariantEngine {
    pub fn new(store: Arc<OpsStore>, incidents: Arc<IncidentManager>) -> Self {
        Self {
            catalogue: default_catalogue(),
            store,
            incidents,
        }
    }

    pub fn with_catalogue(
        catalogue: Vec<Box<dyn Invariant>>,
        store: Arc<OpsStore>,
        incidents: Arc<IncidentManager>,
    ) -> Self {
        Self {
            catalogue,
            store,
            incidents,
        }
    }

    /// Run one integrity cycle: check every invariant in registration
    /// order, attempt safe auto-corrections, persist a bounded violation
    /// sample and one drift score, then feed results into the incident
    /// manager. Incident updates happen after all checks so the drift score
    /// reflects one coherent snapshot.
    pub async fn run_cycle(&self, data: &dyn BusinessData) -> CycleOutcome {
        let mut results = Vec::with_capacity(self.catalogue.len());

        for invariant in &self.catalogue {
            let name = invariant.name();
            let violations = match invariant.check(data) {
                Ok(violations) => violations,
                Err(e) => {
                    error!(invariant = name, error = %e, "invariant check failed");
                    results.push(InvariantResult {
                        invariant: name.to_string(),
                        passed: false,
                        drift_score: 0.0,
                        violations: Vec::new(),
                        auto_corrected: false,
                    });
                    continue;
                }
            };

            let mut auto_corrected = false;
            if !violations.is_empty() && invariant.safe_to_auto_correct() {
                match invariant.auto_correct(data, &violations) {
                    Ok(()) => {
                        auto_corrected = true;
                        info!(invariant = name, count = violations.len(), "auto-corrected violations");
                    }
                    Err(e) => {
                        warn!(invariant = name, error = %e, "auto-correct failed");
                    }
                }
            }

            let count = violations.len();
            results.push(InvariantResult {
                invariant: name.to_string(),
                passed: violations.is_empty() || auto_corrected,
                drift_score: (100.0 - 10.0 * count as f64).max(0.0),
                violations,
                auto_corrected,
            });
        }

        self.persist_violations(&results);

        let drift_score = compute_drift_score(&results);
        let components: HashMap<String, DriftComponent> = results
            .iter()
            .map(|r| {
                (
                    r.invariant.clone(),
                    DriftComponent {
                        passed: r.passed,
                        count: r.violations.len(),
                    },
                )
            })
            .collect();
        self.store.append_drift_sample(DriftScoreSample {
            id: Uuid::new_v4().to_string(),
            score: drift_score,
            components,
            created_at: Utc::now(),
        });
        info!(drift_score, "invariant cycle complete");

        // Every result goes through the lifecycle: failures open or worsen
        // incidents, passes resolve any open incident for that invariant.
        for result in &results {
            let priority = self
                .catalogue
                .iter()
                .find(|i| i.name() == result.invariant)
                .map(|i| i.priority())
                .unwrap_or(Priority::P3);
            self.incidents
                .create_or_update_from_invariant(result, priority)
                .await;
        }

        CycleOutcome {
            results,
            drift_score,
        }
    }

    fn persist_violations(&self, results: &[InvariantResult]) {
        let now = Utc::now();
        let rows: Vec<InvariantViolation> = results
            .iter()
            .flat_map(|result| {
                result.violations.iter().map(|v| InvariantViolation {
                    id: Uuid::new_v4().to_string(),
                    invariant: result.invariant.clone(),
                    shop_id: v.shop_id.clone(),
                    entity_id: v.entity_id.clone(),
                    entity_type: v.entity_type.clone(),
                    details: v.detail.clone(),
                    auto_corrected: result.auto_corrected,
                    incident_id: None,
                    created_at: now,
                })
            })
            .take(MAX_PERSISTED_VIOLATIONS)
            .collect();
        self.store.append_violations(rows);
    }
}
