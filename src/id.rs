use ulid::Ulid;

/// Correlation id attached to every gather in logs.
pub fn new_gather_id() -> String {
    Ulid::new().to_string()
}
