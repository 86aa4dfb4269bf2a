use tracing::{trace, warn};

use crate::store::entities::PracticeRecordEntity;

/// Divergence between the two totals that is still put down to float summation order.
pub const RECONCILIATION_TOLERANCE: f64 = 1e-3;

/// Cross-check of the client-side total against the store aggregate. The store aggregate is
/// the authoritative value; the client total only detects a stale or inconsistent cache.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    pub client_total: f64,
    pub store_total: f64,
}

impl Reconciliation {
    pub fn divergence(&self) -> f64 {
        (self.client_total - self.store_total).abs()
    }

    pub fn is_consistent(&self) -> bool {
        self.divergence() <= RECONCILIATION_TOLERANCE
    }

    /// Reports divergence without preferring either side.
    pub fn report(&self) {
        if self.is_consistent() {
            trace!("Totals agree at {}", self.store_total);
        } else {
            warn!(
                "Client total {} diverges from store total {} by {}",
                self.client_total,
                self.store_total,
                self.divergence()
            );
        }
    }
}

/// Sums durations on the client, independently of the store aggregate.
pub fn client_total<'a>(items: impl IntoIterator<Item = &'a PracticeRecordEntity>) -> f64 {
    items.into_iter().map(|item| *item.duration_minutes).sum()
}
