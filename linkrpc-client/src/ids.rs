//! Process-unique identifiers for connections and requests.

/// Returns a fresh identifier. Only uniqueness is guaranteed, not ordering.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
