use super::{enum_from_text, enum_to_text};
use apix_protocol::AuditRecord;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

pub async fn insert(pool: &PgPool, record: &AuditRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO audit_records
               (id, org_id, user_id, action, resource_type, resource_id, success,
                severity, category, old_values, new_values, "timestamp", ip_address, user_agent)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
           ON CONFLICT (id) DO NOTHING"#,
    )
    .bind(&record.id)
    .bind(&record.org_id)
    .bind(&record.user_id)
    .bind(&record.action)
    .bind(&record.resource_type)
    .bind(&record.resource_id)
    .bind(record.success)
    .bind(enum_to_text(&record.severity))
    .bind(enum_to_text(&record.category))
    .bind(&record.old_values)
    .bind(&record.new_values)
    .bind(record.timestamp)
    .bind(&record.ip_address)
    .bind(&record.user_agent)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn query(
    pool: &PgPool,
    org_id: &str,
    t0: DateTime<Utc>,
    t1: DateTime<Utc>,
    max_n: usize,
) -> Result<Vec<AuditRecord>, sqlx::Error> {
    let rows = sqlx::query(
        r#"SELECT * FROM audit_records
           WHERE org_id = $1 AND "timestamp" >= $2 AND "timestamp" <= $3
           ORDER BY "timestamp" ASC
           LIMIT $4"#,
    )
    .bind(org_id)
    .bind(t0)
    .bind(t1)
    .bind(max_n as i64)
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| {
            let severity_text: String = row.get("severity");
            let category_text: String = row.get("category");
            Ok(AuditRecord {
                id: row.get("id"),
                org_id: row.get("org_id"),
                user_id: row.get("user_id"),
                action: row.get("action"),
                resource_type: row.get("resource_type"),
                resource_id: row.get("resource_id"),
                success: row.get("success"),
                severity: enum_from_text(&severity_text)?,
                category: enum_from_text(&category_text)?,
                old_values: row.get("old_values"),
                new_values: row.get("new_values"),
                timestamp: row.get("timestamp"),
                ip_address: row.get("ip_address"),
                user_agent: row.get("user_agent"),
            })
        })
        .collect()
}
