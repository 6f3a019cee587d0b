use super::{enum_from_text, enum_to_text};
use apix_protocol::DeliveryEndpoint;
use sqlx::{PgPool, Row};

pub async fn put(pool: &PgPool, endpoint: &DeliveryEndpoint) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO delivery_endpoints
               (endpoint_id, org_id, url, method, headers, timeout_ms, retry_policy,
                semantics, active, dlq_enabled, signing_secret)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
           ON CONFLICT (endpoint_id) DO UPDATE SET
               url = EXCLUDED.url,
               method = EXCLUDED.method,
               headers = EXCLUDED.headers,
               timeout_ms = EXCLUDED.timeout_ms,
               retry_policy = EXCLUDED.retry_policy,
               semantics = EXCLUDED.semantics,
               active = EXCLUDED.active,
               dlq_enabled = EXCLUDED.dlq_enabled,
               signing_secret = EXCLUDED.signing_secret"#,
    )
    .bind(&endpoint.endpoint_id)
    .bind(&endpoint.org_id)
    .bind(&endpoint.url)
    .bind(enum_to_text(&endpoint.method))
    .bind(serde_json::to_value(&endpoint.headers).unwrap_or_default())
    .bind(endpoint.timeout_ms as i64)
    .bind(serde_json::to_value(endpoint.retry_policy).unwrap_or_default())
    .bind(enum_to_text(&endpoint.semantics))
    .bind(endpoint.active)
    .bind(endpoint.dlq_enabled)
    .bind(&endpoint.signing_secret)
    .execute(pool)
    .await?;
    Ok(())
}

fn from_row(row: sqlx::postgres::PgRow) -> Result<DeliveryEndpoint, sqlx::Error> {
    let method_text: String = row.get("method");
    let semantics_text: String = row.get("semantics");
    let headers_json: serde_json::Value = row.get("headers");
    let retry_policy_json: serde_json::Value = row.get("retry_policy");
    Ok(DeliveryEndpoint {
        endpoint_id: row.get("endpoint_id"),
        org_id: row.get("org_id"),
        url: row.get("url"),
        method: enum_from_text(&method_text)?,
        headers: serde_json::from_value(headers_json).unwrap_or_default(),
        timeout_ms: row.get::<i64, _>("timeout_ms") as u64,
        retry_policy: serde_json::from_value(retry_policy_json)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        semantics: enum_from_text(&semantics_text)?,
        active: row.get("active"),
        dlq_enabled: row.get("dlq_enabled"),
        signing_secret: row.get("signing_secret"),
    })
}

pub async fn get(
    pool: &PgPool,
    org_id: &str,
    endpoint_id: &str,
) -> Result<Option<DeliveryEndpoint>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT * FROM delivery_endpoints WHERE org_id = $1 AND endpoint_id = $2",
    )
    .bind(org_id)
    .bind(endpoint_id)
    .fetch_optional(pool)
    .await?;
    row.map(from_row).transpose()
}

pub async fn list(pool: &PgPool, org_id: &str) -> Result<Vec<DeliveryEndpoint>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM delivery_endpoints WHERE org_id = $1 ORDER BY created_at")
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(from_row).collect()
}

pub async fn delete(pool: &PgPool, org_id: &str, endpoint_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM delivery_endpoints WHERE org_id = $1 AND endpoint_id = $2")
        .bind(org_id)
        .bind(endpoint_id)
        .execute(pool)
        .await?;
    Ok(())
}
