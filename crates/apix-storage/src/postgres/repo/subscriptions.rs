use apix_protocol::Subscription;
use sqlx::{PgPool, Row};

pub async fn put(pool: &PgPool, subscription: &Subscription) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO subscriptions
               (subscription_id, org_id, user_id, channel, filters, is_active)
           VALUES ($1, $2, $3, $4, $5, $6)
           ON CONFLICT (subscription_id) DO UPDATE SET
               filters = EXCLUDED.filters,
               is_active = EXCLUDED.is_active"#,
    )
    .bind(&subscription.subscription_id)
    .bind(&subscription.org_id)
    .bind(&subscription.user_id)
    .bind(&subscription.channel)
    .bind(serde_json::to_value(&subscription.filters).unwrap_or_default())
    .bind(subscription.is_active)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn deactivate(
    pool: &PgPool,
    org_id: &str,
    subscription_id: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE subscriptions SET is_active = FALSE WHERE org_id = $1 AND subscription_id = $2",
    )
    .bind(org_id)
    .bind(subscription_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list(pool: &PgPool, org_id: &str) -> Result<Vec<Subscription>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM subscriptions WHERE org_id = $1 AND is_active = TRUE")
        .bind(org_id)
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|row| {
            let filters_json: serde_json::Value = row.get("filters");
            Ok(Subscription {
                subscription_id: row.get("subscription_id"),
                org_id: row.get("org_id"),
                user_id: row.get("user_id"),
                channel: row.get("channel"),
                filters: serde_json::from_value(filters_json)
                    .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
                is_active: row.get("is_active"),
            })
        })
        .collect()
}
