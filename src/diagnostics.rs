//! User-visible failure rendering
//!
//! Turns internal errors into the concise diagnostics a CLI or UI shows:
//! build failures get the user's code excerpt alongside the host's build
//! output, everything else gets a short cause-and-effect line with an
//! optional verbose dump.

use crate::Error;

/// Maximum code lines echoed back in a build diagnostic
const EXCERPT_LINES: usize = 12;

/// Render a failure for the end user.
///
/// `code` is the snippet the failure relates to, when there is one.
/// `verbose` appends the full detail map / stack material.
#[must_use]
pub fn render_failure(error: &Error, code: Option<&str>, verbose: bool) -> String {
    match error {
        Error::Build(build_output) => render_build_failure(build_output, code),
        Error::Worker { message, details } => {
            let mut out = format!("execution failed: {message}");
            if verbose {
                if let Some(details) = details {
                    let mut keys: Vec<&String> = details.keys().collect();
                    keys.sort();
                    for key in keys {
                        out.push_str(&format!("\n  {key}: {}", details[key].trim_end()));
                    }
                }
            }
            out
        }
        Error::Sandbox { code: kind, message, status } => {
            let mut out = format!("sandbox rejected the execution ({kind}): {message}");
            if verbose {
                if let Some(status) = status {
                    out.push_str(&format!("\n  http status: {status}"));
                }
            }
            out
        }
        Error::Connection { provider, message } => {
            format!("could not reach provider '{provider}': {message}")
        }
        Error::Validation(message) => format!("invalid request: {message}"),
        Error::Security(message) => format!("code rejected before execution: {message}"),
        other => other.to_string(),
    }
}

/// Build failures echo the snippet so the user sees what failed to compile
fn render_build_failure(build_output: &str, code: Option<&str>) -> String {
    let mut out = String::from("worker failed to build\n");

    if let Some(code) = code {
        out.push_str("\nyour code:\n");
        let lines: Vec<&str> = code.lines().collect();
        for (index, line) in lines.iter().take(EXCERPT_LINES).enumerate() {
            out.push_str(&format!("  {:>3} | {line}\n", index + 1));
        }
        if lines.len() > EXCERPT_LINES {
            out.push_str(&format!("  ... ({} more lines)\n", lines.len() - EXCERPT_LINES));
        }
    }

    let trimmed = build_output.trim();
    if !trimmed.is_empty() {
        out.push_str("\nbuild output:\n");
        for line in trimmed.lines().take(20) {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}
