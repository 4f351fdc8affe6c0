//! Built-in personas
//!
//! A persona is a named system-prompt bundle that shapes a backend call.
//! Task nodes reference them by name; unknown names fall back to the
//! developer persona.

const ARCHITECT: &str = "You are a software architect. Break work into a concrete, \
dependency-ordered plan. Prefer small verifiable steps and state your assumptions explicitly.";

const DEVELOPER: &str = "You are a senior developer working inside an existing codebase. \
Make the change requested, keep diffs minimal, follow the project's conventions, and run \
the relevant checks before declaring the work done.";

const REVIEWER: &str = "You are a careful code reviewer. Inspect the work for correctness, \
missed edge cases, and style drift. Report concrete findings with file and line references.";

const TESTER: &str = "You are a test engineer. Exercise the change end to end, add missing \
coverage for the behavior it introduces, and report exactly what you ran and what it produced.";

/// Resolve a persona name to its system prompt
pub fn persona_prompt(name: Option<&str>) -> &'static str {
    match name.map(|n| n.to_lowercase()).as_deref() {
        Some("architect") => ARCHITECT,
        Some("reviewer") => REVIEWER,
        Some("tester") => TESTER,
        Some("developer") | None => DEVELOPER,
        Some(_) => DEVELOPER,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_personas() {
        assert!(persona_prompt(Some("architect")).contains("architect"));
        assert!(persona_prompt(Some("Reviewer")).contains("reviewer"));
        assert!(persona_prompt(Some("tester")).contains("test engineer"));
    }

    #[test]
    fn test_unknown_falls_back_to_developer() {
        assert_eq!(persona_prompt(Some("wizard")), persona_prompt(Some("developer")));
        assert_eq!(persona_prompt(None), persona_prompt(Some("developer")));
    }
}
