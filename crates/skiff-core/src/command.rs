//! Final command composition.
//!
//! A launch command is an ordered sequence of shell fragments. Without an
//! activation step the fragments are space-joined; with one they are
//! chained with `&&` so an activation failure aborts the run instead of
//! silently executing in the wrong environment.

/// Join command fragments into the final shell command.
pub fn join_fragments(fragments: &[String], chained: bool) -> String {
    fragments.join(if chained { " && " } else { " " })
}

/// Quote a value for safe interpolation into a shell command.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "._-/=:,@+".contains(c));
    if safe {
        value.to_string()
    } else {
        format!("'{}'", value.replace('\'', r#"'\''"#))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_without_activation() {
        let fragments = vec!["docker run --rm image".to_string(), "python train.py".to_string()];
        assert_eq!(
            join_fragments(&fragments, false),
            "docker run --rm image python train.py"
        );
    }

    #[test]
    fn test_join_with_activation_chains() {
        let fragments = vec![
            "source activate skiff-abc".to_string(),
            "python train.py".to_string(),
        ];
        assert_eq!(
            join_fragments(&fragments, true),
            "source activate skiff-abc && python train.py"
        );
    }

    #[test]
    fn test_shell_quote_plain_values_untouched() {
        assert_eq!(shell_quote("0.5"), "0.5");
        assert_eq!(shell_quote("/tmp/data.csv"), "/tmp/data.csv");
        assert_eq!(shell_quote("a_b-c.d"), "a_b-c.d");
    }

    #[test]
    fn test_shell_quote_special_values() {
        assert_eq!(shell_quote("hello world"), "'hello world'");
        assert_eq!(shell_quote("a;rm -rf"), "'a;rm -rf'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }
}
