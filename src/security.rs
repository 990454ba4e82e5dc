//! Pre-execution screening of user code.
//!
//! Snippets are rejected before dispatch when they contain patterns that
//! have no legitimate use inside the sandbox: direct global-object access
//! and dynamic code construction. The sandbox itself is the real boundary;
//! screening exists so obviously hostile snippets fail fast with a clear
//! diagnostic instead of a runtime error.

use crate::{Error, Result};

/// Patterns disallowed in user code, with the reason reported on rejection.
const DISALLOWED_PATTERNS: &[(&str, &str)] = &[
    ("globalThis", "direct global-object access"),
    ("eval(", "dynamic code construction via eval"),
    ("Function(", "dynamic code construction via the Function constructor"),
    ("constructor.constructor", "dynamic code construction via constructor chains"),
    ("importScripts", "dynamic script loading"),
    ("process.binding", "runtime internals access"),
];

/// Screen a user code snippet against the disallowed patterns and the
/// configured length cap.
///
/// # Errors
///
/// `Error::Validation` when the snippet exceeds `max_code_len`;
/// `Error::Security` when a disallowed pattern is present.
pub fn screen_user_code(code: &str, max_code_len: usize) -> Result<()> {
    if code.len() > max_code_len {
        return Err(Error::Validation(format!(
            "code length {} exceeds the {max_code_len} character cap",
            code.len()
        )));
    }
    if code.trim().is_empty() {
        return Err(Error::Validation("code must not be empty".to_string()));
    }

    for (pattern, reason) in DISALLOWED_PATTERNS {
        if code.contains(pattern) {
            return Err(Error::Security(format!(
                "disallowed pattern '{pattern}': {reason}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAP: usize = 50_000;

    #[test]
    fn ordinary_tool_code_passes() {
        let code = r#"const result = await tools.search_items({query: "x"}); return result;"#;
        assert!(screen_user_code(code, CAP).is_ok());
    }

    #[test]
    fn global_this_is_rejected() {
        let err = screen_user_code("globalThis.fetch('https://x.example')", CAP).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn eval_is_rejected() {
        let err = screen_user_code("eval('1+1')", CAP).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn function_constructor_is_rejected() {
        let err = screen_user_code("new Function('return 1')()", CAP).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn constructor_chain_is_rejected() {
        let err = screen_user_code("({}).constructor.constructor('x')", CAP).unwrap_err();
        assert!(matches!(err, Error::Security(_)));
    }

    #[test]
    fn oversized_code_is_a_validation_error() {
        let code = "a".repeat(CAP + 1);
        let err = screen_user_code(&code, CAP).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn empty_code_is_a_validation_error() {
        let err = screen_user_code("   \n", CAP).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn length_exactly_at_cap_passes() {
        let code = format!("return 1;{}", " ".repeat(CAP - 9));
        assert_eq!(code.len(), CAP);
        assert!(screen_user_code(&code, CAP).is_ok());
    }
}
