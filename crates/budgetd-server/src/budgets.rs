//! Budget routes backed by an in-memory, per-tenant store.
//!
//! Reads go through the cache gate under three endpoints:
//!
//! | Route                   | Endpoint         |
//! |-------------------------|------------------|
//! | `GET /budgets`          | `budgets`        |
//! | `GET /budgets/summary`  | `budget-summary` |
//! | `GET /budgets/{id}`     | `budget`         |
//!
//! Writes invalidate every endpoint whose output they can change, after the
//! write succeeded.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    handler::Handler,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{MethodRouter, get},
};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::{Cache, TenantId, cache_gate};
use crate::middleware::{RequireTenant, error_response};
use crate::server::AppState;

pub const LIST_ENDPOINT: &str = "budgets";
pub const SUMMARY_ENDPOINT: &str = "budget-summary";
pub const DETAIL_ENDPOINT: &str = "budget";

/// Largest accepted amount: one trillion in major units.
pub const MAX_AMOUNT_CENTS: i64 = 100_000_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub id: u64,
    pub name: String,
    pub limit_cents: i64,
    pub spent_cents: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetInput {
    pub name: String,
    pub limit_cents: i64,
    #[serde(default)]
    pub spent_cents: i64,
}

impl BudgetInput {
    fn validate(&self) -> Result<(), &'static str> {
        if self.name.trim().is_empty() {
            return Err("name must not be empty");
        }
        if self.limit_cents < 0 || self.spent_cents < 0 {
            return Err("amounts must not be negative");
        }
        if self.limit_cents > MAX_AMOUNT_CENTS || self.spent_cents > MAX_AMOUNT_CENTS {
            return Err("amount is too large");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub count: usize,
    pub total_limit_cents: i64,
    pub total_spent_cents: i64,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// Budgets per tenant. Ids are unique across tenants.
#[derive(Debug, Default)]
pub struct BudgetStore {
    next_id: AtomicU64,
    budgets: DashMap<TenantId, BTreeMap<u64, Budget>>,
}

impl BudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn list(&self, tenant: &TenantId, limit: Option<usize>) -> Vec<Budget> {
        self.budgets
            .get(tenant)
            .map(|budgets| {
                budgets
                    .values()
                    .take(limit.unwrap_or(usize::MAX))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn get(&self, tenant: &TenantId, id: u64) -> Option<Budget> {
        self.budgets.get(tenant)?.get(&id).cloned()
    }

    pub fn summary(&self, tenant: &TenantId) -> BudgetSummary {
        let Some(budgets) = self.budgets.get(tenant) else {
            return BudgetSummary::default();
        };
        budgets.values().fold(
            BudgetSummary::default(),
            |mut summary, budget| {
                summary.count += 1;
                summary.total_limit_cents = summary.total_limit_cents.saturating_add(budget.limit_cents);
                summary.total_spent_cents = summary.total_spent_cents.saturating_add(budget.spent_cents);
                summary
            },
        )
    }

    pub fn create(&self, tenant: &TenantId, input: BudgetInput) -> Budget {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let budget = Budget {
            id,
            name: input.name,
            limit_cents: input.limit_cents,
            spent_cents: input.spent_cents,
        };
        self.budgets
            .entry(tenant.clone())
            .or_default()
            .insert(id, budget.clone());
        budget
    }

    pub fn update(&self, tenant: &TenantId, id: u64, input: BudgetInput) -> Option<Budget> {
        let mut budgets = self.budgets.get_mut(tenant)?;
        let budget = budgets.get_mut(&id)?;
        budget.name = input.name;
        budget.limit_cents = input.limit_cents;
        budget.spent_cents = input.spent_cents;
        Some(budget.clone())
    }

    pub fn delete(&self, tenant: &TenantId, id: u64) -> bool {
        self.budgets
            .get_mut(tenant)
            .is_some_and(|mut budgets| budgets.remove(&id).is_some())
    }
}

/// Budget routes. With `cache` set, every GET goes through the cache gate
/// with `ttl_secs`.
pub fn routes(cache: Option<&Cache>, ttl_secs: u64) -> Router<AppState> {
    Router::new()
        .route(
            "/budgets",
            cached(list_budgets, cache, LIST_ENDPOINT, ttl_secs).post(create_budget),
        )
        .route(
            "/budgets/summary",
            cached(budget_summary, cache, SUMMARY_ENDPOINT, ttl_secs),
        )
        .route(
            "/budgets/{id}",
            cached(get_budget, cache, DETAIL_ENDPOINT, ttl_secs)
                .put(update_budget)
                .delete(delete_budget),
        )
}

fn cached<H, T>(handler: H, cache: Option<&Cache>, endpoint: &str, ttl_secs: u64) -> MethodRouter<AppState>
where
    H: Handler<T, AppState>,
    T: 'static,
{
    let route = get(handler);
    match cache {
        Some(cache) => route.layer(middleware::from_fn_with_state(
            cache.gate(endpoint, ttl_secs),
            cache_gate,
        )),
        None => route,
    }
}

async fn list_budgets(
    State(state): State<AppState>,
    RequireTenant(tenant): RequireTenant,
    Query(params): Query<ListParams>,
) -> Json<Vec<Budget>> {
    Json(state.budgets.list(&tenant, params.limit))
}

async fn budget_summary(
    State(state): State<AppState>,
    RequireTenant(tenant): RequireTenant,
) -> Json<BudgetSummary> {
    Json(state.budgets.summary(&tenant))
}

async fn get_budget(
    State(state): State<AppState>,
    RequireTenant(tenant): RequireTenant,
    Path(id): Path<u64>,
) -> Response {
    match state.budgets.get(&tenant, id) {
        Some(budget) => Json(budget).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "budget not found"),
    }
}

async fn create_budget(
    State(state): State<AppState>,
    RequireTenant(tenant): RequireTenant,
    Json(input): Json<BudgetInput>,
) -> Response {
    if let Err(msg) = input.validate() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, msg);
    }
    let budget = state.budgets.create(&tenant, input);
    tracing::info!(tenant = %tenant, budget_id = budget.id, "budget created");

    state
        .cache
        .invalidator()
        .invalidate_endpoints(&tenant, &[LIST_ENDPOINT, SUMMARY_ENDPOINT])
        .await;

    (StatusCode::CREATED, Json(budget)).into_response()
}

async fn update_budget(
    State(state): State<AppState>,
    RequireTenant(tenant): RequireTenant,
    Path(id): Path<u64>,
    Json(input): Json<BudgetInput>,
) -> Response {
    if let Err(msg) = input.validate() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, msg);
    }
    let Some(budget) = state.budgets.update(&tenant, id, input) else {
        return error_response(StatusCode::NOT_FOUND, "budget not found");
    };
    tracing::info!(tenant = %tenant, budget_id = id, "budget updated");

    state
        .cache
        .invalidator()
        .invalidate_endpoints(&tenant, &[LIST_ENDPOINT, SUMMARY_ENDPOINT, DETAIL_ENDPOINT])
        .await;

    Json(budget).into_response()
}

async fn delete_budget(
    State(state): State<AppState>,
    RequireTenant(tenant): RequireTenant,
    Path(id): Path<u64>,
) -> Response {
    if !state.budgets.delete(&tenant, id) {
        return error_response(StatusCode::NOT_FOUND, "budget not found");
    }
    tracing::info!(tenant = %tenant, budget_id = id, "budget deleted");

    state
        .cache
        .invalidator()
        .invalidate_endpoints(&tenant, &[LIST_ENDPOINT, SUMMARY_ENDPOINT, DETAIL_ENDPOINT])
        .await;

    StatusCode::NO_CONTENT.into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, limit_cents: i64) -> BudgetInput {
        BudgetInput {
            name: name.into(),
            limit_cents,
            spent_cents: 0,
        }
    }

    #[test]
    fn test_store_is_scoped_per_tenant() {
        let store = BudgetStore::new();
        let alice = TenantId::from("1");
        let bob = TenantId::from("2");

        let groceries = store.create(&alice, input("groceries", 40_000));
        store.create(&bob, input("rent", 150_000));

        assert_eq!(store.list(&alice, None), vec![groceries.clone()]);
        assert!(store.get(&bob, groceries.id).is_none());
        assert!(!store.delete(&bob, groceries.id));
        assert!(store.delete(&alice, groceries.id));
        assert!(store.list(&alice, None).is_empty());
    }

    #[test]
    fn test_list_limit_and_summary() {
        let store = BudgetStore::new();
        let tenant = TenantId::from("1");
        store.create(&tenant, input("a", 100));
        store.create(&tenant, input("b", 200));
        store.create(&tenant, input("c", 300));

        assert_eq!(store.list(&tenant, Some(2)).len(), 2);
        assert_eq!(
            store.summary(&tenant),
            BudgetSummary {
                count: 3,
                total_limit_cents: 600,
                total_spent_cents: 0,
            }
        );
        assert_eq!(store.summary(&TenantId::from("9")), BudgetSummary::default());
    }

    #[test]
    fn test_summary_totals_saturate() {
        let store = BudgetStore::new();
        let tenant = TenantId::from("1");
        store.create(&tenant, input("a", i64::MAX));
        store.create(&tenant, input("b", i64::MAX));

        let summary = store.summary(&tenant);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.total_limit_cents, i64::MAX);
    }

    #[test]
    fn test_update_missing_budget() {
        let store = BudgetStore::new();
        let tenant = TenantId::from("1");
        assert!(store.update(&tenant, 42, input("x", 1)).is_none());

        let created = store.create(&tenant, input("x", 1));
        let updated = store.update(&tenant, created.id, input("y", 2)).unwrap();
        assert_eq!(updated.name, "y");
        assert_eq!(updated.limit_cents, 2);
    }

    #[test]
    fn test_input_validation() {
        assert!(input("ok", 0).validate().is_ok());
        assert!(input("  ", 10).validate().is_err());
        assert!(input("neg", -1).validate().is_err());
        assert!(input("max", MAX_AMOUNT_CENTS).validate().is_ok());
        assert!(input("huge", i64::MAX).validate().is_err());
    }
}
