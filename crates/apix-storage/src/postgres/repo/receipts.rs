use super::{enum_from_text, enum_to_text};
use apix_protocol::DeliveryReceipt;
use sqlx::{PgPool, Row};

pub async fn put(pool: &PgPool, receipt: &DeliveryReceipt) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO delivery_receipts
               (receipt_id, event_id, endpoint_id, org_id, status, attempts,
                first_attempt_at, last_attempt_at, acknowledged_at, response_code,
                response_time_ms, error)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
           ON CONFLICT (receipt_id) DO UPDATE SET
               status = EXCLUDED.status,
               attempts = EXCLUDED.attempts,
               last_attempt_at = EXCLUDED.last_attempt_at,
               acknowledged_at = EXCLUDED.acknowledged_at,
               response_code = EXCLUDED.response_code,
               response_time_ms = EXCLUDED.response_time_ms,
               error = EXCLUDED.error"#,
    )
    .bind(&receipt.receipt_id)
    .bind(&receipt.event_id)
    .bind(&receipt.endpoint_id)
    .bind(&receipt.org_id)
    .bind(enum_to_text(&receipt.status))
    .bind(receipt.attempts as i32)
    .bind(receipt.first_attempt_at)
    .bind(receipt.last_attempt_at)
    .bind(receipt.acknowledged_at)
    .bind(receipt.response_code.map(|c| c as i32))
    .bind(receipt.response_time_ms.map(|ms| ms as i64))
    .bind(&receipt.error)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(
    pool: &PgPool,
    org_id: &str,
    receipt_id: &str,
) -> Result<Option<DeliveryReceipt>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM delivery_receipts WHERE org_id = $1 AND receipt_id = $2")
        .bind(org_id)
        .bind(receipt_id)
        .fetch_optional(pool)
        .await?;
    let row = match row {
        Some(row) => row,
        None => return Ok(None),
    };
    let status_text: String = row.get("status");
    Ok(Some(DeliveryReceipt {
        receipt_id: row.get("receipt_id"),
        event_id: row.get("event_id"),
        endpoint_id: row.get("endpoint_id"),
        org_id: row.get("org_id"),
        status: enum_from_text(&status_text)?,
        attempts: row.get::<i32, _>("attempts") as u32,
        first_attempt_at: row.get("first_attempt_at"),
        last_attempt_at: row.get("last_attempt_at"),
        acknowledged_at: row.get("acknowledged_at"),
        response_code: row.get::<Option<i32>, _>("response_code").map(|c| c as u16),
        response_time_ms: row
            .get::<Option<i64>, _>("response_time_ms")
            .map(|ms| ms as u64),
        error: row.get("error"),
    }))
}
