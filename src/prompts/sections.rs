use std::collections::BTreeMap;

use appforge_common::{ValidationError, ValidationErrorKind};

use super::PromptInputs;

/// Most errors listed per kind in a fix prompt.
const MAX_ERRORS_PER_KIND: usize = 40;

pub(super) fn base(_: &PromptInputs<'_>) -> String {
    r#"You are an expert full-stack engineer. Build the application the user describes as a complete, runnable project.

Stack:
- Frontend: React with TypeScript, bundled by Vite (entry `index.html`, sources under `src/`).
- Backend: Express with TypeScript under `server/`, entry `server/index.ts`, listening on `process.env.PORT`.
- Data: Prisma with SQLite, schema in `prisma/schema.prisma`.
- The frontend reaches the backend through `/api` routes proxied by Vite.

Rules:
- Write every file the app needs, including `package.json` with all dependencies and scripts.
- Keep the code type-safe; it must pass `tsc --noEmit`.
- Prefer small focused files over one large file.
- Do not ask the user questions. Make reasonable product decisions and build."#
        .to_string()
}

pub(super) fn template_addon(inputs: &PromptInputs<'_>) -> String {
    format!(
        r#"## Starting point
The project already contains the `{}` starter template: build configuration, `package.json`, the Vite and Express entry points and a Prisma schema stub.
- Read the existing files before changing them.
- Extend the template instead of recreating its configuration.
- Add dependencies to the existing `package.json` rather than replacing it."#,
        inputs.config.template_name()
    )
}

pub(super) fn building_blocks(_: &PromptInputs<'_>) -> String {
    r#"## Building blocks
Use these patterns where they fit instead of inventing new ones:
- CRUD resource: Prisma model, Express router with list/get/create/update/delete, React list + form.
- Form with validation: controlled inputs, inline error messages, disabled submit while pending.
- Data table: sortable columns, empty state, loading state.
- Layout shell: header with navigation, main content area, responsive at small widths.
- Fetch hook: `useApi` wrapping fetch with loading and error state."#
        .to_string()
}

pub(super) fn plan_addon(inputs: &PromptInputs<'_>) -> String {
    let Some(plan) = inputs.plan else {
        return String::new();
    };
    format!(
        "## Architecture plan\nImplement this plan. Every model, route and component listed must exist.\n\n{}",
        plan.to_markdown()
    )
}

pub(super) fn tool_rules(_: &PromptInputs<'_>) -> String {
    r#"## Tools
- `write_file` creates or overwrites a file; paths are relative to the project root.
- `read_file` and `list_files` inspect the project.
- `run_command` runs one whitelisted command (npm, npx, node, tsc, prisma and basic file utilities). Pipes, `&&`, `;` and substitutions are rejected.
- When everything is written, reply with a short summary and stop calling tools."#
        .to_string()
}

pub(super) fn fix_base(_: &PromptInputs<'_>) -> String {
    r#"You are fixing compiler and schema errors in an existing full-stack TypeScript project (React + Vite frontend, Express backend, Prisma schema).

- Read each affected file before editing it.
- Make the smallest change that fixes the error; do not rewrite working code.
- Fix schema errors first, since generated Prisma types feed the type checker.
- Do not add new features.
- When done, reply with a one-line summary of what you changed."#
        .to_string()
}

/// System prompt for the planning call.
pub fn planning_system_prompt() -> &'static str {
    "You are a software architect. Design the application the user describes as a React + Express + Prisma project. \
     Call the create_plan tool exactly once with the data models, API routes and UI components it needs. \
     Keep the plan minimal but complete."
}

/// User message for an error-fixing call: errors grouped by kind, schema
/// errors first.
pub fn fix_user_prompt(errors: &[ValidationError], attempt: u8, max_attempts: u8) -> String {
    let mut grouped: BTreeMap<ValidationErrorKind, Vec<&ValidationError>> = BTreeMap::new();
    for error in errors {
        grouped.entry(error.kind).or_default().push(error);
    }

    let mut out = format!(
        "Fix attempt {} of {}. The project has {} error(s).\n",
        attempt, max_attempts, errors.len()
    );
    for (kind, list) in grouped {
        let heading = match kind {
            ValidationErrorKind::Schema => "Prisma schema errors",
            ValidationErrorKind::Type => "TypeScript errors",
        };
        out.push_str(&format!("\n## {} ({})\n", heading, list.len()));
        for error in list.iter().take(MAX_ERRORS_PER_KIND) {
            out.push_str(&format!("- {}\n", error));
        }
        if list.len() > MAX_ERRORS_PER_KIND {
            out.push_str(&format!("- ... and {} more\n", list.len() - MAX_ERRORS_PER_KIND));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_prompt_groups_schema_before_type() {
        let errors = vec![
            ValidationError::new(ValidationErrorKind::Type, "src/App.tsx", "Cannot find name 'x'.")
                .at(3, Some(5))
                .with_code("TS2304"),
            ValidationError::new(ValidationErrorKind::Schema, "prisma/schema.prisma", "Unknown type")
                .at(12, None),
            ValidationError::new(ValidationErrorKind::Type, "server/index.ts", "Missing return"),
        ];
        let prompt = fix_user_prompt(&errors, 1, 3);
        assert!(prompt.starts_with("Fix attempt 1 of 3. The project has 3 error(s)."));
        let schema_at = prompt.find("## Prisma schema errors (1)").unwrap();
        let type_at = prompt.find("## TypeScript errors (2)").unwrap();
        assert!(schema_at < type_at);
        assert!(prompt.contains("- src/App.tsx:3:5 - TS2304: Cannot find name 'x'."));
    }

    #[test]
    fn test_fix_prompt_caps_each_group() {
        let errors: Vec<ValidationError> = (0..45)
            .map(|i| ValidationError::new(ValidationErrorKind::Type, format!("f{}.ts", i), "bad"))
            .collect();
        let prompt = fix_user_prompt(&errors, 2, 2);
        assert!(prompt.contains("- ... and 5 more"));
        assert!(!prompt.contains("f44.ts"));
    }
}
