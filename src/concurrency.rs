//! In-flight concurrency gates: global, per-tenant, and per-route.
//!
//! Each gate resolves its limit from a [`LimitSpec`] (constant, map, or
//! fallible function of metadata). A request is admitted only when every
//! enabled gate has headroom; on acquire the gating keys are stashed on the
//! request so release can never be confused by mutated metadata.

use crate::request::RequestMetadata;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

type LimitResolver = Arc<
    dyn Fn(&RequestMetadata) -> Result<Option<u32>, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// How a per-key concurrency limit is determined.
#[derive(Clone)]
pub enum LimitSpec {
    /// Same limit for every key.
    Fixed(u32),
    /// Explicit limits per key; absent keys are unlimited.
    PerKey(HashMap<String, u32>),
    /// Computed from request metadata. Errors are logged and treated as
    /// "no limit", reusing the last successful value when one exists.
    Resolver(LimitResolver),
}

impl LimitSpec {
    pub fn resolver<F>(f: F) -> Self
    where
        F: Fn(&RequestMetadata) -> Result<Option<u32>, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        LimitSpec::Resolver(Arc::new(f))
    }
}

impl fmt::Debug for LimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitSpec::Fixed(n) => f.debug_tuple("Fixed").field(n).finish(),
            LimitSpec::PerKey(map) => f.debug_tuple("PerKey").field(map).finish(),
            LimitSpec::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// Which gate refused admission, with its observed occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateFull {
    Global { in_flight: u32, max: u32 },
    Tenant { key: String, in_flight: u32, limit: u32 },
    Route { key: String, in_flight: u32, limit: u32 },
}

/// Keys a dispatched request holds slots under, stashed for release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GateKeys {
    pub tenant: Option<String>,
    pub route: Option<String>,
}

#[derive(Debug)]
pub(crate) enum ConcurrencyDecision {
    Allow(GateKeys),
    Wait(Vec<GateFull>),
}

/// Tracks in-flight counts for the global, per-tenant, and per-route gates.
pub(crate) struct ConcurrencyLimiter {
    max_concurrent: Option<u32>,
    per_tenant: Option<LimitSpec>,
    per_route: Option<LimitSpec>,
    global_in_flight: u32,
    tenant_counts: HashMap<String, u32>,
    route_counts: HashMap<String, u32>,
    last_tenant_limit: Option<u32>,
    last_route_limit: Option<u32>,
}

impl ConcurrencyLimiter {
    pub fn new(
        max_concurrent: Option<u32>,
        per_tenant: Option<LimitSpec>,
        per_route: Option<LimitSpec>,
    ) -> Self {
        Self {
            max_concurrent,
            per_tenant,
            per_route,
            global_in_flight: 0,
            tenant_counts: HashMap::new(),
            route_counts: HashMap::new(),
            last_tenant_limit: None,
            last_route_limit: None,
        }
    }

    pub fn global_in_flight(&self) -> u32 {
        self.global_in_flight
    }

    pub fn global_saturated(&self) -> bool {
        matches!(self.max_concurrent, Some(max) if self.global_in_flight >= max)
    }

    fn resolve_limit(
        spec: &LimitSpec,
        key: &str,
        metadata: &RequestMetadata,
        last_good: &mut Option<u32>,
    ) -> Option<u32> {
        match spec {
            LimitSpec::Fixed(limit) => Some(*limit),
            LimitSpec::PerKey(map) => map.get(key).copied(),
            LimitSpec::Resolver(resolve) => match resolve(metadata) {
                Ok(limit) => {
                    if let Some(value) = limit {
                        *last_good = Some(value);
                    }
                    limit
                }
                Err(error) => {
                    tracing::warn!(key, %error, "concurrency limit resolver failed");
                    *last_good
                }
            },
        }
    }

    /// Evaluate all gates for a candidate without mutating any counter.
    pub fn check(
        &mut self,
        metadata: &RequestMetadata,
        route_key: &str,
    ) -> ConcurrencyDecision {
        let mut full = Vec::new();

        if let Some(max) = self.max_concurrent {
            if self.global_in_flight >= max {
                full.push(GateFull::Global { in_flight: self.global_in_flight, max });
            }
        }

        let mut keys = GateKeys::default();

        if let Some(spec) = &self.per_tenant {
            if let Some(tenant) = metadata.tenant_id.as_deref() {
                if let Some(limit) =
                    Self::resolve_limit(spec, tenant, metadata, &mut self.last_tenant_limit)
                {
                    let in_flight = self.tenant_counts.get(tenant).copied().unwrap_or(0);
                    if in_flight >= limit {
                        full.push(GateFull::Tenant {
                            key: tenant.to_string(),
                            in_flight,
                            limit,
                        });
                    } else {
                        keys.tenant = Some(tenant.to_string());
                    }
                }
            }
        }

        if let Some(spec) = &self.per_route {
            if let Some(limit) =
                Self::resolve_limit(spec, route_key, metadata, &mut self.last_route_limit)
            {
                let in_flight = self.route_counts.get(route_key).copied().unwrap_or(0);
                if in_flight >= limit {
                    full.push(GateFull::Route {
                        key: route_key.to_string(),
                        in_flight,
                        limit,
                    });
                } else {
                    keys.route = Some(route_key.to_string());
                }
            }
        }

        if full.is_empty() {
            ConcurrencyDecision::Allow(keys)
        } else {
            ConcurrencyDecision::Wait(full)
        }
    }

    /// Take slots under exactly the keys a prior `check` admitted.
    pub fn acquire(&mut self, keys: &GateKeys) {
        self.global_in_flight += 1;
        if let Some(tenant) = &keys.tenant {
            *self.tenant_counts.entry(tenant.clone()).or_insert(0) += 1;
        }
        if let Some(route) = &keys.route {
            *self.route_counts.entry(route.clone()).or_insert(0) += 1;
        }
    }

    /// Release slots using the stashed keys. Zero-count entries are removed
    /// so long-lived processes never accumulate dead tenant keys.
    pub fn release(&mut self, keys: &GateKeys) {
        if self.global_in_flight == 0 {
            tracing::warn!("global in-flight count released below zero");
        }
        self.global_in_flight = self.global_in_flight.saturating_sub(1);

        if let Some(tenant) = &keys.tenant {
            Self::release_key(&mut self.tenant_counts, tenant);
        }
        if let Some(route) = &keys.route {
            Self::release_key(&mut self.route_counts, route);
        }
    }

    fn release_key(counts: &mut HashMap<String, u32>, key: &str) {
        match counts.get_mut(key) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                counts.remove(key);
            }
            None => tracing::warn!(key, "released a key with no in-flight count"),
        }
    }

    #[cfg(test)]
    fn tenant_count(&self, tenant: &str) -> Option<u32> {
        self.tenant_counts.get(tenant).copied()
    }
}

impl fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("max_concurrent", &self.max_concurrent)
            .field("global_in_flight", &self.global_in_flight)
            .field("tenant_counts", &self.tenant_counts)
            .field("route_counts", &self.route_counts)
            .finish()
    }
}
