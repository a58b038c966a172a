//! Turn raw compiler and schema-tool output into `ValidationError` records.
//!
//! Everything here is pure: no I/O, no state.

mod prisma;
mod typescript;

use std::sync::LazyLock;

use appforge_common::{ValidationError, ValidationErrorKind};
use regex::Regex;

pub use prisma::parse_prisma_output;
pub use typescript::parse_tsc_output;

static ANSI_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").unwrap());

/// Longest message kept on a fallback record.
const GENERIC_MESSAGE_LEN: usize = 400;

pub(crate) fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    ANSI_REGEX.replace_all(text, "")
}

/// Parse tool output for `kind`. When the tool failed but nothing could be
/// parsed, a single generic record keeps the failure visible to the fixer.
pub fn parse_validation_output(
    kind: ValidationErrorKind,
    output: &str,
    succeeded: bool,
) -> Vec<ValidationError> {
    let errors = match kind {
        ValidationErrorKind::Type => parse_tsc_output(output),
        ValidationErrorKind::Schema => parse_prisma_output(output),
    };
    if errors.is_empty() && !succeeded {
        return vec![generic_failure(kind, output)];
    }
    errors
}

fn generic_failure(kind: ValidationErrorKind, output: &str) -> ValidationError {
    let file = match kind {
        ValidationErrorKind::Type => "tsconfig.json",
        ValidationErrorKind::Schema => "prisma/schema.prisma",
    };
    let cleaned = strip_ansi(output);
    let summary: Vec<&str> = cleaned
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .take(5)
        .collect();
    let message = if summary.is_empty() {
        format!("{} check failed without output", kind.as_str())
    } else {
        crate::util::truncate_str(&summary.join(" "), GENERIC_MESSAGE_LEN)
    };
    ValidationError::new(kind, file, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_run_without_parsable_errors_yields_generic_record() {
        let errors = parse_validation_output(
            ValidationErrorKind::Type,
            "\x1b[31mSomething exploded\x1b[0m\n\n",
            false,
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, "tsconfig.json");
        assert_eq!(errors[0].message, "Something exploded");
    }

    #[test]
    fn test_failed_run_without_output() {
        let errors = parse_validation_output(ValidationErrorKind::Schema, "", false);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("schema"));
    }

    #[test]
    fn test_successful_run_without_errors_is_clean() {
        assert!(parse_validation_output(ValidationErrorKind::Type, "", true).is_empty());
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[96msrc/a.ts\x1b[0m"), "src/a.ts");
    }
}
