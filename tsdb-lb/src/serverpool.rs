//! The backend pool and the retention-based routing strategy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::TsdbBackend;

/// Backends grouped by cluster id, in registration order.
///
/// The pool is filled at startup and never mutated afterwards; request
/// handling and the health probe only read it.
#[derive(Default)]
pub struct ServerPool {
    backends: HashMap<String, Vec<Arc<TsdbBackend>>>,
}

impl ServerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, cluster_id: impl Into<String>, backend: Arc<TsdbBackend>) {
        let cluster_id = cluster_id.into();
        log::debug!("backend {} added to cluster {cluster_id}", backend.url());
        self.backends.entry(cluster_id).or_default().push(backend);
    }

    pub fn backends(&self, cluster_id: &str) -> Option<&[Arc<TsdbBackend>]> {
        self.backends.get(cluster_id).map(Vec::as_slice)
    }

    pub fn size(&self, cluster_id: &str) -> usize {
        self.backends.get(cluster_id).map(Vec::len).unwrap_or(0)
    }

    pub fn all_backends(&self) -> impl Iterator<Item = &Arc<TsdbBackend>> {
        self.backends.values().flatten()
    }
}

/// Retention-based routing.
///
/// A TSDB with a short retention is the hot tier: faster and cheaper. A
/// query goes to the smallest retention that still covers its window;
/// within that tier, least connections spreads the load and registration
/// order breaks the remaining ties.
pub struct RetentionRouter {
    pool: Arc<ServerPool>,
}

impl RetentionRouter {
    pub fn new(pool: Arc<ServerPool>) -> Self {
        Self { pool }
    }

    /// Picks the backend to serve a query reaching `query_window` into the
    /// past, or `None` when no alive backend covers it.
    pub fn target(&self, cluster_id: &str, query_window: Duration) -> Option<Arc<TsdbBackend>> {
        self.target_excluding(cluster_id, query_window, &[])
    }

    /// Same as [`target`](Self::target), skipping backends that already
    /// failed this request, so a retry lands on the next-ranked one.
    pub fn target_excluding(
        &self,
        cluster_id: &str,
        query_window: Duration,
        exclude: &[Arc<TsdbBackend>],
    ) -> Option<Arc<TsdbBackend>> {
        let Some(backends) = self.pool.backends(cluster_id) else {
            // only a misconfigured scrape target or client gets here
            log::error!("unknown cluster id: {cluster_id}");
            return None;
        };

        // a backend whose retention equals the window cannot serve the
        // window's oldest sample: strictly greater only
        let eligible: Vec<&Arc<TsdbBackend>> = backends
            .iter()
            .filter(|backend| !exclude.iter().any(|failed| Arc::ptr_eq(failed, backend)))
            .filter(|backend| backend.is_alive() && query_window < backend.retention_period())
            .collect();

        let chosen = match eligible.as_slice() {
            [] => {
                log::debug!("no eligible backend in cluster {cluster_id} for window {query_window:?}");
                return None;
            }
            [only] => only,
            _ => {
                let min_retention = eligible.iter().map(|b| b.retention_period()).min()?;
                eligible
                    .iter()
                    .filter(|b| b.retention_period() == min_retention)
                    .min_by_key(|b| b.active_connections())?
            }
        };
        log::debug!(
            "cluster {cluster_id}, window {query_window:?}: selected backend {}",
            chosen.url()
        );
        Some(Arc::clone(chosen))
    }
}
