//! Persistent-store boundary for LIF: declarative query plans, the provider
//! store contract, Postgres and in-memory implementations, and the advisory
//! TTL query cache.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lif_core::{
    haversine_miles, valid_area_token, CoverageList, ProviderChanges, ProviderRecord, Testimonial,
};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use thiserror::Error;
use tokio::sync::Mutex;

pub const CRATE_NAME: &str = "lif-store";

pub const PROVIDER_TABLE: &str = "providers";

const PROVIDER_COLUMNS: [&str; 23] = [
    "id",
    "name",
    "email",
    "phone",
    "mobile",
    "website",
    "about",
    "status",
    "coverage",
    "main_area",
    "latitude",
    "longitude",
    "priority",
    "priority_started_at",
    "offer",
    "lessons",
    "social",
    "tutor",
    "cache_stale",
    "password_hash",
    "recovery_hash",
    "created_at",
    "updated_at",
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("column {0:?} is not a known provider column")]
    UnknownColumn(String),
    #[error("order key {0:?} is not valid for this query")]
    InvalidOrder(String),
}

fn check_column(name: &str) -> Result<(), StoreError> {
    if PROVIDER_COLUMNS.contains(&name) {
        Ok(())
    } else {
        Err(StoreError::UnknownColumn(name.to_string()))
    }
}

/// A bound query parameter. Every dynamic value reaches SQL through one of
/// these, never through string interpolation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
    Null,
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(v) => write!(f, "i:{v}"),
            Value::Float(v) => write!(f, "f:{v}"),
            Value::Text(v) => write!(f, "t:{v}"),
            Value::Bool(v) => write!(f, "b:{v}"),
            Value::Null => write!(f, "null"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// Column predicate: a literal for equality or an operator/value pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Ge(Value),
    Lt(Value),
    Le(Value),
    IsNull,
    IsNotNull,
}

/// Ordering element for listing and search queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderKey {
    Asc(String),
    Desc(String),
    /// Rows carrying an offer sort before rows without one.
    OffersFirst,
    /// Computed geodesic distance, nearest first. Geo search plans only.
    Nearest,
    Random,
}

/// Coverage requirement attached to a search plan. Tokens are stored
/// unwrapped; implementations add the wrapping delimiters when matching.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CoverageFilter {
    #[default]
    Any,
    Area(String),
    AnyOf(Vec<String>),
    /// Matches no rows. Produced when normalization yields an unusable token.
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoOrigin {
    pub latitude: f64,
    pub longitude: f64,
}

/// Declarative provider search: predicates, coverage requirement, optional
/// geodesic ranking, ordering, limit. Implementations translate the plan to
/// their querying substrate; every dynamic value stays a bound parameter.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchPlan {
    pub clauses: BTreeMap<String, Predicate>,
    pub coverage: CoverageFilter,
    pub origin: Option<GeoOrigin>,
    pub cutoff_miles: Option<f64>,
    pub order: Vec<OrderKey>,
    pub limit: u32,
}

/// A provider row produced by `search`, with the computed distance when the
/// plan carried a geodesic origin.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    pub record: ProviderRecord,
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    Global,
    Provider(i64),
}

/// Contract the catalog consumes. `Ok(None)` from the read operations means
/// "zero matching rows"; failures are always `Err` — the two are never
/// conflated.
#[async_trait]
pub trait ProviderStore: Send + Sync {
    async fn select(
        &self,
        predicates: &BTreeMap<String, Predicate>,
    ) -> Result<Option<ProviderRecord>, StoreError>;

    async fn select_all(
        &self,
        predicates: &BTreeMap<String, Predicate>,
        order: &[OrderKey],
        limit: Option<u32>,
        cache_ttl: Option<Duration>,
    ) -> Result<Option<Vec<ProviderRecord>>, StoreError>;

    async fn insert(&self, record: &ProviderRecord) -> Result<bool, StoreError>;

    async fn update(&self, id: i64, changes: &ProviderChanges) -> Result<bool, StoreError>;

    async fn search(
        &self,
        plan: &SearchPlan,
        cache_ttl: Option<Duration>,
    ) -> Result<Option<Vec<SearchRow>>, StoreError>;

    /// Demote every prioritized provider whose boost started at or before the
    /// given instant. Returns the number of demoted rows; a run with no stale
    /// rows is a no-op.
    async fn clear_stale_priorities(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn testimonials_for(
        &self,
        provider_id: i64,
        limit: u32,
    ) -> Result<Vec<Testimonial>, StoreError>;

    async fn invalidate(&self, scope: InvalidationScope) -> Result<(), StoreError>;
}

/// Advisory TTL cache for read queries, keyed by a digest of the rendered
/// statement and its parameters. The no-rows sentinel is cached as well.
#[derive(Debug, Default)]
pub struct QueryCache<T> {
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    expires_at: Instant,
    rows: Option<Vec<T>>,
}

impl<T: Clone> QueryCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Option<Vec<T>>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.rows.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn put(&self, key: String, rows: Option<Vec<T>>, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let mut entries = self.entries.lock().await;
        entries.insert(
            key,
            CacheEntry {
                expires_at: Instant::now() + ttl,
                rows,
            },
        );
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}

pub fn cache_key(statement: &str, params: &[Value]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(statement.as_bytes());
    for param in params {
        hasher.update(param.to_string().as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Rendered SQL plus its bind list, in placeholder order.
#[derive(Debug, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

fn push_param(params: &mut Vec<Value>, value: Value) -> String {
    params.push(value);
    format!("${}", params.len())
}

fn render_predicates(
    clauses: &BTreeMap<String, Predicate>,
    params: &mut Vec<Value>,
    fragments: &mut Vec<String>,
) -> Result<(), StoreError> {
    for (column, predicate) in clauses {
        check_column(column)?;
        let fragment = match predicate {
            Predicate::IsNull | Predicate::Eq(Value::Null) => format!("{column} IS NULL"),
            Predicate::IsNotNull | Predicate::Ne(Value::Null) => format!("{column} IS NOT NULL"),
            Predicate::Gt(Value::Null)
            | Predicate::Ge(Value::Null)
            | Predicate::Lt(Value::Null)
            | Predicate::Le(Value::Null) => "FALSE".to_string(),
            Predicate::Eq(value) => {
                format!("{column} = {}", push_param(params, value.clone()))
            }
            Predicate::Ne(value) => {
                format!("{column} <> {}", push_param(params, value.clone()))
            }
            Predicate::Gt(value) => {
                format!("{column} > {}", push_param(params, value.clone()))
            }
            Predicate::Ge(value) => {
                format!("{column} >= {}", push_param(params, value.clone()))
            }
            Predicate::Lt(value) => {
                format!("{column} < {}", push_param(params, value.clone()))
            }
            Predicate::Le(value) => {
                format!("{column} <= {}", push_param(params, value.clone()))
            }
        };
        fragments.push(fragment);
    }
    Ok(())
}

fn render_coverage(
    coverage: &CoverageFilter,
    params: &mut Vec<Value>,
    fragments: &mut Vec<String>,
) {
    match coverage {
        CoverageFilter::Any => {}
        CoverageFilter::Nothing => fragments.push("FALSE".to_string()),
        CoverageFilter::Area(token) => fragments.push(coverage_like(token, params)),
        CoverageFilter::AnyOf(tokens) => {
            if tokens.is_empty() {
                fragments.push("FALSE".to_string());
                return;
            }
            let alternatives: Vec<String> = tokens
                .iter()
                .map(|token| coverage_like(token, params))
                .collect();
            fragments.push(format!("({})", alternatives.join(" OR ")));
        }
    }
}

fn coverage_like(token: &str, params: &mut Vec<Value>) -> String {
    let token = token.trim().to_uppercase();
    if !valid_area_token(&token) {
        return "FALSE".to_string();
    }
    let placeholder = push_param(params, Value::Text(format!(",{token},")));
    format!("coverage LIKE '%' || {placeholder} || '%'")
}

fn render_order(
    order: &[OrderKey],
    allow_distance: bool,
) -> Result<Option<String>, StoreError> {
    if order.is_empty() {
        return Ok(None);
    }
    let mut keys = Vec::with_capacity(order.len());
    for key in order {
        let rendered = match key {
            OrderKey::Asc(column) => {
                check_column(column)?;
                format!("{column} ASC")
            }
            OrderKey::Desc(column) => {
                check_column(column)?;
                format!("{column} DESC")
            }
            OrderKey::OffersFirst => "(offer IS NOT NULL) DESC".to_string(),
            OrderKey::Nearest => {
                if !allow_distance {
                    return Err(StoreError::InvalidOrder("distance".to_string()));
                }
                "distance ASC".to_string()
            }
            OrderKey::Random => "RANDOM()".to_string(),
        };
        keys.push(rendered);
    }
    Ok(Some(keys.join(", ")))
}

pub fn render_select(clauses: &BTreeMap<String, Predicate>) -> Result<RenderedQuery, StoreError> {
    let mut params = Vec::new();
    let mut fragments = Vec::new();
    render_predicates(clauses, &mut params, &mut fragments)?;
    let mut sql = format!("SELECT * FROM {PROVIDER_TABLE}");
    if !fragments.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&fragments.join(" AND "));
    }
    sql.push_str(" LIMIT 1");
    Ok(RenderedQuery { sql, params })
}

pub fn render_select_all(
    clauses: &BTreeMap<String, Predicate>,
    order: &[OrderKey],
    limit: Option<u32>,
) -> Result<RenderedQuery, StoreError> {
    let mut params = Vec::new();
    let mut fragments = Vec::new();
    render_predicates(clauses, &mut params, &mut fragments)?;
    let mut sql = format!("SELECT * FROM {PROVIDER_TABLE}");
    if !fragments.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&fragments.join(" AND "));
    }
    if let Some(order_by) = render_order(order, false)? {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_by);
    }
    if let Some(limit) = limit {
        let placeholder = push_param(&mut params, Value::Int(limit as i64));
        sql.push_str(&format!(" LIMIT {placeholder}"));
    }
    Ok(RenderedQuery { sql, params })
}

/// Render a search plan. Geo plans compute the haversine distance in SQL from
/// a bound origin and filter on the cutoff in an outer query; coverage-only
/// plans carry a NULL distance column so row mapping stays uniform.
pub fn render_search(plan: &SearchPlan) -> Result<RenderedQuery, StoreError> {
    let mut params = Vec::new();
    let mut fragments = Vec::new();

    if plan.origin.is_some() {
        fragments.push("latitude IS NOT NULL".to_string());
        fragments.push("longitude IS NOT NULL".to_string());
    }
    render_predicates(&plan.clauses, &mut params, &mut fragments)?;
    render_coverage(&plan.coverage, &mut params, &mut fragments);

    let where_clause = if fragments.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", fragments.join(" AND "))
    };

    let mut sql = match plan.origin {
        Some(origin) => {
            let lat = push_param(&mut params, Value::Float(origin.latitude));
            let lng = push_param(&mut params, Value::Float(origin.longitude));
            let mut sql = format!(
                "SELECT * FROM (SELECT *, ({radius} * acos(least(1.0, \
                 cos(radians({lat})) * cos(radians(latitude)) * cos(radians(longitude) - radians({lng})) \
                 + sin(radians({lat})) * sin(radians(latitude))))) AS distance \
                 FROM {PROVIDER_TABLE}{where_clause}) ranked",
                radius = lif_core::EARTH_RADIUS_MILES,
            );
            if let Some(cutoff) = plan.cutoff_miles {
                let cutoff = push_param(&mut params, Value::Float(cutoff));
                sql.push_str(&format!(" WHERE ranked.distance < {cutoff}"));
            }
            sql
        }
        None => format!(
            "SELECT *, NULL::float8 AS distance FROM {PROVIDER_TABLE}{where_clause}"
        ),
    };

    if let Some(order_by) = render_order(&plan.order, true)? {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_by);
    }
    let limit = push_param(&mut params, Value::Int(plan.limit as i64));
    sql.push_str(&format!(" LIMIT {limit}"));

    Ok(RenderedQuery { sql, params })
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bool(v) => query.bind(*v),
        Value::Null => query.bind(Option::<String>::None),
    }
}

fn provider_from_row(row: &PgRow) -> Result<ProviderRecord, sqlx::Error> {
    let coverage: String = row.try_get("coverage")?;
    Ok(ProviderRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        mobile: row.try_get("mobile")?,
        website: row.try_get("website")?,
        about: row.try_get("about")?,
        status: row.try_get("status")?,
        coverage: CoverageList::from_stored(&coverage),
        main_area: row.try_get("main_area")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        priority: row.try_get("priority")?,
        priority_started_at: row.try_get("priority_started_at")?,
        offer: row.try_get("offer")?,
        lessons: row.try_get("lessons")?,
        social: row.try_get("social")?,
        tutor: row.try_get("tutor")?,
        cache_stale: row.try_get("cache_stale")?,
        password_hash: row.try_get("password_hash")?,
        recovery_hash: row.try_get("recovery_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn none_when_empty<T>(rows: Vec<T>) -> Option<Vec<T>> {
    if rows.is_empty() {
        None
    } else {
        Some(rows)
    }
}

/// Postgres-backed store. All dynamic values are bound parameters;
/// identifiers come from the fixed column whitelist.
pub struct PgStore {
    pool: PgPool,
    record_cache: QueryCache<ProviderRecord>,
    search_cache: QueryCache<SearchRow>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            record_cache: QueryCache::new(),
            search_cache: QueryCache::new(),
        }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|err| StoreError::Database(sqlx::Error::Migrate(Box::new(err))))
    }

    async fn fetch_records(&self, rendered: &RenderedQuery) -> Result<Vec<ProviderRecord>, StoreError> {
        let mut query = sqlx::query(&rendered.sql);
        for param in &rendered.params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(provider_from_row(row)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl ProviderStore for PgStore {
    async fn select(
        &self,
        predicates: &BTreeMap<String, Predicate>,
    ) -> Result<Option<ProviderRecord>, StoreError> {
        let rendered = render_select(predicates)?;
        tracing::debug!(sql = %rendered.sql, "provider select");
        Ok(self.fetch_records(&rendered).await?.into_iter().next())
    }

    async fn select_all(
        &self,
        predicates: &BTreeMap<String, Predicate>,
        order: &[OrderKey],
        limit: Option<u32>,
        cache_ttl: Option<Duration>,
    ) -> Result<Option<Vec<ProviderRecord>>, StoreError> {
        let rendered = render_select_all(predicates, order, limit)?;
        let key = cache_key(&rendered.sql, &rendered.params);
        if let Some(ttl) = cache_ttl {
            if let Some(cached) = self.record_cache.get(&key).await {
                return Ok(cached);
            }
            let result = none_when_empty(self.fetch_records(&rendered).await?);
            self.record_cache.put(key, result.clone(), ttl).await;
            return Ok(result);
        }
        tracing::debug!(sql = %rendered.sql, "provider select_all");
        Ok(none_when_empty(self.fetch_records(&rendered).await?))
    }

    async fn insert(&self, record: &ProviderRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "INSERT INTO providers (id, name, email, phone, mobile, website, about, status, \
             coverage, main_area, latitude, longitude, priority, priority_started_at, offer, \
             lessons, social, tutor, cache_stale, password_hash, recovery_hash, created_at, \
             updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21, $22, $23) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.email)
        .bind(&record.phone)
        .bind(&record.mobile)
        .bind(&record.website)
        .bind(&record.about)
        .bind(record.status)
        .bind(record.coverage.as_stored())
        .bind(&record.main_area)
        .bind(record.latitude)
        .bind(record.longitude)
        .bind(record.priority)
        .bind(record.priority_started_at)
        .bind(&record.offer)
        .bind(&record.lessons)
        .bind(&record.social)
        .bind(record.tutor)
        .bind(record.cache_stale)
        .bind(&record.password_hash)
        .bind(&record.recovery_hash)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update(&self, id: i64, changes: &ProviderChanges) -> Result<bool, StoreError> {
        if changes.is_empty() {
            return Ok(false);
        }

        let mut params: Vec<Value> = Vec::new();
        let mut sets: Vec<String> = Vec::new();

        fn set_text(
            column: &str,
            value: &Option<String>,
            sets: &mut Vec<String>,
            params: &mut Vec<Value>,
        ) {
            if let Some(value) = value {
                if value.trim().is_empty() {
                    sets.push(format!("{column} = NULL"));
                } else {
                    let placeholder = push_param(params, Value::Text(value.clone()));
                    sets.push(format!("{column} = {placeholder}"));
                }
            }
        }

        set_text("name", &changes.name, &mut sets, &mut params);
        set_text("email", &changes.email, &mut sets, &mut params);
        set_text("phone", &changes.phone, &mut sets, &mut params);
        set_text("mobile", &changes.mobile, &mut sets, &mut params);
        set_text("website", &changes.website, &mut sets, &mut params);
        set_text("about", &changes.about, &mut sets, &mut params);
        set_text("main_area", &changes.main_area, &mut sets, &mut params);
        set_text("offer", &changes.offer, &mut sets, &mut params);
        set_text("lessons", &changes.lessons, &mut sets, &mut params);
        set_text("social", &changes.social, &mut sets, &mut params);

        if let Some(status) = changes.status {
            let placeholder = push_param(&mut params, Value::Int(status as i64));
            sets.push(format!("status = {placeholder}"));
        }
        if let Some(coverage) = &changes.coverage {
            let placeholder = push_param(&mut params, Value::Text(coverage.as_stored().to_string()));
            sets.push(format!("coverage = {placeholder}"));
        }
        if let Some(latitude) = changes.latitude {
            let placeholder = push_param(&mut params, Value::Float(latitude));
            sets.push(format!("latitude = {placeholder}"));
        }
        if let Some(longitude) = changes.longitude {
            let placeholder = push_param(&mut params, Value::Float(longitude));
            sets.push(format!("longitude = {placeholder}"));
        }
        if let Some(priority) = changes.priority {
            let placeholder = push_param(&mut params, Value::Bool(priority));
            sets.push(format!("priority = {placeholder}"));
        }
        if let Some(started_at) = changes.priority_started_at {
            let placeholder = push_param(&mut params, Value::Text(started_at.to_rfc3339()));
            sets.push(format!("priority_started_at = {placeholder}::timestamptz"));
        }
        if let Some(tutor) = changes.tutor {
            let placeholder = push_param(&mut params, Value::Bool(tutor));
            sets.push(format!("tutor = {placeholder}"));
        }
        if let Some(cache_stale) = changes.cache_stale {
            let placeholder = push_param(&mut params, Value::Bool(cache_stale));
            sets.push(format!("cache_stale = {placeholder}"));
        }

        sets.push("updated_at = NOW()".to_string());
        let id_placeholder = push_param(&mut params, Value::Int(id));
        let sql = format!(
            "UPDATE {PROVIDER_TABLE} SET {} WHERE id = {id_placeholder}",
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql);
        for param in &params {
            query = bind_value(query, param);
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn search(
        &self,
        plan: &SearchPlan,
        cache_ttl: Option<Duration>,
    ) -> Result<Option<Vec<SearchRow>>, StoreError> {
        let rendered = render_search(plan)?;
        tracing::debug!(sql = %rendered.sql, "provider search");

        let key = cache_key(&rendered.sql, &rendered.params);
        if let Some(ttl) = cache_ttl {
            if let Some(cached) = self.search_cache.get(&key).await {
                return Ok(cached);
            }
        }

        let mut query = sqlx::query(&rendered.sql);
        for param in &rendered.params {
            query = bind_value(query, param);
        }
        let rows = query.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(SearchRow {
                record: provider_from_row(row)?,
                distance: row.try_get("distance")?,
            });
        }

        let result = none_when_empty(out);
        if let Some(ttl) = cache_ttl {
            self.search_cache.put(key, result.clone(), ttl).await;
        }
        Ok(result)
    }

    async fn clear_stale_priorities(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE providers SET priority = FALSE, priority_started_at = NULL, \
             updated_at = NOW() \
             WHERE priority = TRUE AND priority_started_at IS NOT NULL \
             AND priority_started_at <= $1",
        )
        .bind(started_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn testimonials_for(
        &self,
        provider_id: i64,
        limit: u32,
    ) -> Result<Vec<Testimonial>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, provider_id, author, quote FROM testimonials \
             WHERE provider_id = $1 ORDER BY RANDOM() LIMIT $2",
        )
        .bind(provider_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(Testimonial {
                id: row.try_get("id")?,
                provider_id: row.try_get("provider_id")?,
                author: row.try_get("author")?,
                quote: row.try_get("quote")?,
            });
        }
        Ok(out)
    }

    async fn invalidate(&self, scope: InvalidationScope) -> Result<(), StoreError> {
        self.record_cache.clear().await;
        self.search_cache.clear().await;
        if let InvalidationScope::Provider(id) = scope {
            sqlx::query("UPDATE providers SET cache_stale = TRUE WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }
}

/// In-memory store used by tests and fixture-first development. Evaluates
/// the same plans the Postgres implementation renders to SQL.
#[derive(Debug, Default)]
pub struct MemStore {
    providers: Mutex<Vec<ProviderRecord>>,
    testimonials: Mutex<Vec<Testimonial>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, records: Vec<ProviderRecord>) {
        self.providers.lock().await.extend(records);
    }

    pub async fn seed_testimonials(&self, rows: Vec<Testimonial>) {
        self.testimonials.lock().await.extend(rows);
    }
}

fn field_value(record: &ProviderRecord, column: &str) -> Result<Value, StoreError> {
    fn text(value: &Option<String>) -> Value {
        match value {
            Some(v) => Value::Text(v.clone()),
            None => Value::Null,
        }
    }
    fn float(value: Option<f64>) -> Value {
        match value {
            Some(v) => Value::Float(v),
            None => Value::Null,
        }
    }

    Ok(match column {
        "id" => Value::Int(record.id),
        "name" => Value::Text(record.name.clone()),
        "email" => Value::Text(record.email.clone()),
        "phone" => text(&record.phone),
        "mobile" => text(&record.mobile),
        "website" => text(&record.website),
        "about" => text(&record.about),
        "status" => Value::Int(record.status as i64),
        "coverage" => Value::Text(record.coverage.as_stored().to_string()),
        "main_area" => text(&record.main_area),
        "latitude" => float(record.latitude),
        "longitude" => float(record.longitude),
        "priority" => Value::Bool(record.priority),
        "priority_started_at" => match record.priority_started_at {
            Some(ts) => Value::Text(ts.to_rfc3339()),
            None => Value::Null,
        },
        "offer" => text(&record.offer),
        "lessons" => text(&record.lessons),
        "social" => text(&record.social),
        "tutor" => Value::Bool(record.tutor),
        "cache_stale" => Value::Bool(record.cache_stale),
        "password_hash" => text(&record.password_hash),
        "recovery_hash" => text(&record.recovery_hash),
        "created_at" => Value::Text(record.created_at.to_rfc3339()),
        "updated_at" => Value::Text(record.updated_at.to_rfc3339()),
        other => return Err(StoreError::UnknownColumn(other.to_string())),
    })
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => a.as_f64().zip(b.as_f64()).and_then(|(a, b)| a.partial_cmp(&b)),
    }
}

fn matches_predicate(value: &Value, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::IsNull | Predicate::Eq(Value::Null) => matches!(value, Value::Null),
        Predicate::IsNotNull | Predicate::Ne(Value::Null) => !matches!(value, Value::Null),
        Predicate::Gt(Value::Null)
        | Predicate::Ge(Value::Null)
        | Predicate::Lt(Value::Null)
        | Predicate::Le(Value::Null) => false,
        Predicate::Eq(expected) => compare_values(value, expected) == Some(Ordering::Equal),
        Predicate::Ne(expected) => {
            matches!(compare_values(value, expected), Some(ordering) if ordering != Ordering::Equal)
        }
        Predicate::Gt(expected) => compare_values(value, expected) == Some(Ordering::Greater),
        Predicate::Ge(expected) => {
            matches!(compare_values(value, expected), Some(Ordering::Greater | Ordering::Equal))
        }
        Predicate::Lt(expected) => compare_values(value, expected) == Some(Ordering::Less),
        Predicate::Le(expected) => {
            matches!(compare_values(value, expected), Some(Ordering::Less | Ordering::Equal))
        }
    }
}

fn matches_clauses(
    record: &ProviderRecord,
    clauses: &BTreeMap<String, Predicate>,
) -> Result<bool, StoreError> {
    for (column, predicate) in clauses {
        if !matches_predicate(&field_value(record, column)?, predicate) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_coverage(record: &ProviderRecord, coverage: &CoverageFilter) -> bool {
    match coverage {
        CoverageFilter::Any => true,
        CoverageFilter::Nothing => false,
        CoverageFilter::Area(token) => record.coverage.contains(token),
        CoverageFilter::AnyOf(tokens) => {
            !tokens.is_empty() && tokens.iter().any(|token| record.coverage.contains(token))
        }
    }
}

struct RankedCandidate {
    row: SearchRow,
    jitter: f64,
}

fn order_candidates(
    candidates: &mut [RankedCandidate],
    order: &[OrderKey],
) -> Result<(), StoreError> {
    for key in order {
        if let OrderKey::Asc(column) | OrderKey::Desc(column) = key {
            check_column(column)?;
        }
    }

    let mut failure: Option<StoreError> = None;
    candidates.sort_by(|a, b| {
        for key in order {
            let ordering = match key {
                OrderKey::Asc(column) | OrderKey::Desc(column) => {
                    let left = field_value(&a.row.record, column);
                    let right = field_value(&b.row.record, column);
                    match (left, right) {
                        (Ok(left), Ok(right)) => {
                            let base = compare_values(&left, &right)
                                .unwrap_or(Ordering::Equal);
                            if matches!(key, OrderKey::Desc(_)) {
                                base.reverse()
                            } else {
                                base
                            }
                        }
                        (Err(err), _) | (_, Err(err)) => {
                            failure.get_or_insert(err);
                            Ordering::Equal
                        }
                    }
                }
                OrderKey::OffersFirst => b
                    .row
                    .record
                    .has_offer()
                    .cmp(&a.row.record.has_offer()),
                OrderKey::Nearest => a
                    .row
                    .distance
                    .partial_cmp(&b.row.distance)
                    .unwrap_or(Ordering::Equal),
                OrderKey::Random => a
                    .jitter
                    .partial_cmp(&b.jitter)
                    .unwrap_or(Ordering::Equal),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[async_trait]
impl ProviderStore for MemStore {
    async fn select(
        &self,
        predicates: &BTreeMap<String, Predicate>,
    ) -> Result<Option<ProviderRecord>, StoreError> {
        let providers = self.providers.lock().await;
        for record in providers.iter() {
            if matches_clauses(record, predicates)? {
                return Ok(Some(record.clone()));
            }
        }
        Ok(None)
    }

    async fn select_all(
        &self,
        predicates: &BTreeMap<String, Predicate>,
        order: &[OrderKey],
        limit: Option<u32>,
        _cache_ttl: Option<Duration>,
    ) -> Result<Option<Vec<ProviderRecord>>, StoreError> {
        let providers = self.providers.lock().await;
        let mut candidates = Vec::new();
        for record in providers.iter() {
            if matches_clauses(record, predicates)? {
                candidates.push(RankedCandidate {
                    row: SearchRow {
                        record: record.clone(),
                        distance: None,
                    },
                    jitter: fastrand::f64(),
                });
            }
        }
        drop(providers);

        order_candidates(&mut candidates, order)?;
        if let Some(limit) = limit {
            candidates.truncate(limit as usize);
        }
        Ok(none_when_empty(
            candidates.into_iter().map(|c| c.row.record).collect(),
        ))
    }

    async fn insert(&self, record: &ProviderRecord) -> Result<bool, StoreError> {
        let mut providers = self.providers.lock().await;
        if providers.iter().any(|existing| existing.id == record.id) {
            return Ok(false);
        }
        providers.push(record.clone());
        Ok(true)
    }

    async fn update(&self, id: i64, changes: &ProviderChanges) -> Result<bool, StoreError> {
        if changes.is_empty() {
            return Ok(false);
        }
        let mut providers = self.providers.lock().await;
        let Some(record) = providers.iter_mut().find(|record| record.id == id) else {
            return Ok(false);
        };

        fn apply_text(slot: &mut Option<String>, change: &Option<String>) {
            if let Some(value) = change {
                *slot = if value.trim().is_empty() {
                    None
                } else {
                    Some(value.clone())
                };
            }
        }

        if let Some(name) = &changes.name {
            record.name = name.clone();
        }
        if let Some(email) = &changes.email {
            record.email = email.clone();
        }
        apply_text(&mut record.phone, &changes.phone);
        apply_text(&mut record.mobile, &changes.mobile);
        apply_text(&mut record.website, &changes.website);
        apply_text(&mut record.about, &changes.about);
        apply_text(&mut record.main_area, &changes.main_area);
        apply_text(&mut record.offer, &changes.offer);
        apply_text(&mut record.lessons, &changes.lessons);
        apply_text(&mut record.social, &changes.social);
        if let Some(status) = changes.status {
            record.status = status;
        }
        if let Some(coverage) = &changes.coverage {
            record.coverage = coverage.clone();
        }
        if let Some(latitude) = changes.latitude {
            record.latitude = Some(latitude);
        }
        if let Some(longitude) = changes.longitude {
            record.longitude = Some(longitude);
        }
        if let Some(priority) = changes.priority {
            record.priority = priority;
        }
        if let Some(started_at) = changes.priority_started_at {
            record.priority_started_at = Some(started_at);
        }
        if let Some(tutor) = changes.tutor {
            record.tutor = tutor;
        }
        if let Some(cache_stale) = changes.cache_stale {
            record.cache_stale = cache_stale;
        }
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn search(
        &self,
        plan: &SearchPlan,
        _cache_ttl: Option<Duration>,
    ) -> Result<Option<Vec<SearchRow>>, StoreError> {
        let providers = self.providers.lock().await;
        let mut candidates = Vec::new();
        for record in providers.iter() {
            if plan.origin.is_some() && (record.latitude.is_none() || record.longitude.is_none()) {
                continue;
            }
            if !matches_clauses(record, &plan.clauses)? {
                continue;
            }
            if !matches_coverage(record, &plan.coverage) {
                continue;
            }

            let distance = plan.origin.map(|origin| {
                haversine_miles(
                    origin.latitude,
                    origin.longitude,
                    record.latitude.unwrap_or_default(),
                    record.longitude.unwrap_or_default(),
                )
            });
            if let (Some(distance), Some(cutoff)) = (distance, plan.cutoff_miles) {
                if distance >= cutoff {
                    continue;
                }
            }
            candidates.push(RankedCandidate {
                row: SearchRow {
                    record: record.clone(),
                    distance,
                },
                jitter: fastrand::f64(),
            });
        }
        drop(providers);

        order_candidates(&mut candidates, &plan.order)?;
        candidates.truncate(plan.limit as usize);
        Ok(none_when_empty(
            candidates.into_iter().map(|c| c.row).collect(),
        ))
    }

    async fn clear_stale_priorities(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut providers = self.providers.lock().await;
        let mut demoted = 0;
        for record in providers.iter_mut() {
            let stale = record.priority
                && record
                    .priority_started_at
                    .map(|started| started <= started_before)
                    .unwrap_or(false);
            if stale {
                record.priority = false;
                record.priority_started_at = None;
                record.updated_at = Utc::now();
                demoted += 1;
            }
        }
        Ok(demoted)
    }

    async fn testimonials_for(
        &self,
        provider_id: i64,
        limit: u32,
    ) -> Result<Vec<Testimonial>, StoreError> {
        let testimonials = self.testimonials.lock().await;
        let mut matching: Vec<Testimonial> = testimonials
            .iter()
            .filter(|t| t.provider_id == provider_id)
            .cloned()
            .collect();
        drop(testimonials);
        fastrand::shuffle(&mut matching);
        matching.truncate(limit as usize);
        Ok(matching)
    }

    async fn invalidate(&self, scope: InvalidationScope) -> Result<(), StoreError> {
        if let InvalidationScope::Provider(id) = scope {
            let mut providers = self.providers.lock().await;
            if let Some(record) = providers.iter_mut().find(|record| record.id == id) {
                record.cache_stale = true;
            }
        }
        Ok(())
    }
}
