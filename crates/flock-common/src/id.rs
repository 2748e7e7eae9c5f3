/// Generate an operation ID: a hyphenated UUID v7.
/// The v7 timestamp prefix keeps IDs roughly sortable by creation time.
pub fn generate_operation_id() -> String {
    uuid::Uuid::now_v7().hyphenated().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn operation_id_is_a_uuid() {
        let id = generate_operation_id();
        assert_eq!(id.len(), 36);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn operation_ids_are_unique() {
        let ids: HashSet<String> = (0..100).map(|_| generate_operation_id()).collect();
        assert_eq!(ids.len(), 100, "100 generated IDs should all be unique");
    }
}
