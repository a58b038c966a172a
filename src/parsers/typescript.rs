use std::sync::LazyLock;

use appforge_common::{ValidationError, ValidationErrorKind};
use regex::Regex;

use super::strip_ansi;

/// `src/App.tsx(12,5): error TS2304: Cannot find name 'x'.`
static PAREN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>[^\s(][^(]*)\((?P<line>\d+),(?P<col>\d+)\):\s+error\s+(?P<code>TS\d+):\s*(?P<msg>.*)$").unwrap()
});

/// `src/App.tsx:12:5 - error TS2304: Cannot find name 'x'.`
static PRETTY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<file>\S[^:]*):(?P<line>\d+):(?P<col>\d+)\s+-\s+error\s+(?P<code>TS\d+):\s*(?P<msg>.*)$").unwrap()
});

/// `error TS5058: The specified path does not exist: 'tsconfig.json'.`
static GLOBAL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^error\s+(?P<code>TS\d+):\s*(?P<msg>.*)$").unwrap());

/// Parse `tsc` output in either the plain or the pretty format. Indented
/// lines directly after a plain-format error are appended to its message.
pub fn parse_tsc_output(output: &str) -> Vec<ValidationError> {
    let cleaned = strip_ansi(output);
    let mut errors: Vec<ValidationError> = Vec::new();
    let mut continuing = false;

    for raw in cleaned.lines() {
        let line = raw.trim_end();
        if let Some(caps) = PAREN_REGEX.captures(line) {
            errors.push(build(&caps));
            continuing = true;
            continue;
        }
        if let Some(caps) = PRETTY_REGEX.captures(line) {
            errors.push(build(&caps));
            continuing = false;
            continue;
        }
        if let Some(caps) = GLOBAL_REGEX.captures(line.trim_start()) {
            errors.push(
                ValidationError::new(ValidationErrorKind::Type, "tsconfig.json", caps["msg"].trim())
                    .with_code(&caps["code"]),
            );
            continuing = false;
            continue;
        }
        if continuing
            && raw.starts_with(char::is_whitespace)
            && !line.trim().is_empty()
            && let Some(last) = errors.last_mut()
        {
            last.message.push('\n');
            last.message.push_str(line.trim());
            continue;
        }
        continuing = false;
    }
    errors
}

fn build(caps: &regex::Captures<'_>) -> ValidationError {
    let line = caps["line"].parse().unwrap_or(0);
    let col = caps["col"].parse().ok();
    ValidationError::new(ValidationErrorKind::Type, caps["file"].trim(), caps["msg"].trim())
        .at(line, col)
        .with_code(&caps["code"])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_format() {
        let out = "src/App.tsx(12,5): error TS2304: Cannot find name 'useState'.\n\
                   server/index.ts(3,1): error TS2307: Cannot find module 'express' or its corresponding type declarations.\n";
        let errors = parse_tsc_output(out);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].file, "src/App.tsx");
        assert_eq!(errors[0].line, Some(12));
        assert_eq!(errors[0].column, Some(5));
        assert_eq!(errors[0].code.as_deref(), Some("TS2304"));
        assert_eq!(errors[0].message, "Cannot find name 'useState'.");
        assert_eq!(errors[1].file, "server/index.ts");
        assert_eq!(errors[1].kind, ValidationErrorKind::Type);
    }

    #[test]
    fn test_parse_pretty_format_with_colors() {
        let out = "\x1b[96msrc/main.tsx\x1b[0m:\x1b[93m7\x1b[0m:\x1b[93m10\x1b[0m - \x1b[91merror\x1b[0m\x1b[90m TS2322: \x1b[0mType 'string' is not assignable to type 'number'.\n\
                   \n\
                   7   const n: number = 'a';\n\
                   \x20            ~\n\
                   \n\
                   Found 1 error in src/main.tsx:7\n";
        let errors = parse_tsc_output(out);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, "src/main.tsx");
        assert_eq!(errors[0].line, Some(7));
        assert_eq!(errors[0].column, Some(10));
        assert_eq!(errors[0].code.as_deref(), Some("TS2322"));
        assert_eq!(errors[0].message, "Type 'string' is not assignable to type 'number'.");
    }

    #[test]
    fn test_parse_continuation_lines() {
        let out = "src/a.ts(1,7): error TS2322: Type '{ a: string; }' is not assignable to type 'B'.\n  Property 'b' is missing in type '{ a: string; }'.\nsrc/b.ts(2,1): error TS1005: ';' expected.\n";
        let errors = parse_tsc_output(out);
        assert_eq!(errors.len(), 2);
        assert!(errors[0].message.ends_with("Property 'b' is missing in type '{ a: string; }'."));
        assert_eq!(errors[1].message, "';' expected.");
    }

    #[test]
    fn test_parse_global_error() {
        let errors = parse_tsc_output("error TS5058: The specified path does not exist: 'tsconfig.json'.\n");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].file, "tsconfig.json");
        assert_eq!(errors[0].line, None);
        assert_eq!(errors[0].code.as_deref(), Some("TS5058"));
    }

    #[test]
    fn test_parse_clean_output() {
        assert!(parse_tsc_output("").is_empty());
        assert!(parse_tsc_output("Found 0 errors.\n").is_empty());
    }
}
