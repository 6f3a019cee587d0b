pub mod audit;
pub mod endpoints;
pub mod receipts;
pub mod subscriptions;

/// Round-trips an enum through its own `Serialize`/`Deserialize` as a bare
/// Postgres `TEXT` value, reusing the wire-format rename rules (e.g.
/// `SCREAMING_SNAKE_CASE`) instead of hand-duplicating them as a match.
pub(crate) fn enum_to_text<T: serde::Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

pub(crate) fn enum_from_text<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, sqlx::Error> {
    serde_json::from_value(serde_json::Value::String(text.to_owned()))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
