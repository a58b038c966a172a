use std::sync::LazyLock;

use appforge_common::{ValidationError, ValidationErrorKind};
use regex::Regex;

use super::strip_ansi;

const DEFAULT_SCHEMA_FILE: &str = "prisma/schema.prisma";

static ERROR_LINE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^error:\s*(?P<msg>.+)$").unwrap());

static LOCATION_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-->\s*(?P<file>[^\s:]+):(?P<line>\d+)(?::(?P<col>\d+))?").unwrap()
});

static CODE_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b(?P<code>P\d{4})\b").unwrap());

/// Parse `prisma validate` / `prisma generate` output. Each `error:` line
/// starts a record; a following `-->  file:line` pins its location and the
/// nearest preceding `P1012`-style code is attached.
pub fn parse_prisma_output(output: &str) -> Vec<ValidationError> {
    let cleaned = strip_ansi(output);
    let mut errors: Vec<ValidationError> = Vec::new();
    let mut code: Option<String> = None;
    let mut awaiting_location = false;

    for raw in cleaned.lines() {
        let line = raw.trim();
        if let Some(caps) = ERROR_LINE_REGEX.captures(line) {
            let mut err = ValidationError::new(
                ValidationErrorKind::Schema,
                DEFAULT_SCHEMA_FILE,
                caps["msg"].trim(),
            );
            if let Some(c) = &code {
                err = err.with_code(c.clone());
            }
            errors.push(err);
            awaiting_location = true;
            continue;
        }
        if awaiting_location
            && let Some(caps) = LOCATION_REGEX.captures(line)
            && let Some(last) = errors.last_mut()
        {
            last.file = normalize_schema_path(&caps["file"]);
            last.line = caps["line"].parse().ok();
            last.column = caps.name("col").and_then(|c| c.as_str().parse().ok());
            awaiting_location = false;
            continue;
        }
        if (line.starts_with("Error code:") || line.starts_with("Error:"))
            && let Some(caps) = CODE_REGEX.captures(line)
        {
            code = Some(caps["code"].to_string());
        }
    }
    errors
}

/// Prisma sometimes reports the bare file name.
fn normalize_schema_path(file: &str) -> String {
    if file == "schema.prisma" {
        DEFAULT_SCHEMA_FILE.to_string()
    } else {
        file.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"Prisma schema loaded from prisma/schema.prisma
Error: Prisma schema validation - (validate wasm)
Error code: P1012
error: Type "Strin" is neither a built-in type, nor refers to another model, composite type, or enum.
  -->  prisma/schema.prisma:14
   |
13 |   id    Int     @id @default(autoincrement())
14 |   name  Strin
   |
error: Error validating model "Todo": The relation field `user` on Model `Todo` is missing an opposite relation field.
  -->  schema.prisma:22:3
   |

Validation Error Count: 2
[Context: validate]
"#;

    #[test]
    fn test_parse_validation_errors_with_locations() {
        let errors = parse_prisma_output(SAMPLE);
        assert_eq!(errors.len(), 2);

        assert_eq!(errors[0].kind, ValidationErrorKind::Schema);
        assert_eq!(errors[0].file, "prisma/schema.prisma");
        assert_eq!(errors[0].line, Some(14));
        assert_eq!(errors[0].column, None);
        assert_eq!(errors[0].code.as_deref(), Some("P1012"));
        assert!(errors[0].message.starts_with("Type \"Strin\""));

        assert_eq!(errors[1].file, "prisma/schema.prisma");
        assert_eq!(errors[1].line, Some(22));
        assert_eq!(errors[1].column, Some(3));
    }

    #[test]
    fn test_parse_error_without_location() {
        let out = "Error code: P1012\nerror: Environment variable not found: DATABASE_URL.\n";
        let errors = parse_prisma_output(out);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, "prisma/schema.prisma");
        assert_eq!(errors[0].line, None);
        assert_eq!(errors[0].message, "Environment variable not found: DATABASE_URL.");
    }

    #[test]
    fn test_parse_valid_schema_output() {
        let out = "Prisma schema loaded from prisma/schema.prisma\nThe schema at prisma/schema.prisma is valid 🚀\n";
        assert!(parse_prisma_output(out).is_empty());
    }
}
