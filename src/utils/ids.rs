use uuid::Uuid;

/// Generate a record id of the form `<kind>-<uuid>`.
///
/// Used whenever a command omits an id that must be generated.
#[must_use]
pub fn prefixed_id(kind: &str) -> String {
    format!("{kind}-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_the_kind_prefix() {
        let id = prefixed_id("directory");
        assert!(id.starts_with("directory-"));
        assert_eq!(id.len(), "directory-".len() + 36);
    }
}
