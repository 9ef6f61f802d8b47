use bundle_fs::normalize_resource_name;
use proptest::prelude::*;

proptest! {
    #[test]
    fn normalized_names_never_escape_the_root(s in "\\PC*") {
        if let Ok(name) = normalize_resource_name(&s) {
            prop_assert!(!name.contains('\\'));
            prop_assert!(!name.starts_with('/'));
            prop_assert!(!name.split('/').any(|p| p == ".." || p.is_empty()));
            // normalization is idempotent
            prop_assert_eq!(normalize_resource_name(&name).unwrap(), name);
        }
    }
}
