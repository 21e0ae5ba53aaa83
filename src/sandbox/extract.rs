//! Pulling runnable code out of a generation leaf's reply, and matching
//! sandbox outputs back to artifact filenames.

use super::SandboxError;
use crate::adapters::SandboxOutput;

/// Strip the wrapper around generated code.
///
/// Accepts a Markdown fence (with or without a language tag), a
/// `<code>...</code>` wrapper, or bare code. An unterminated wrapper or an
/// empty body is an error.
pub fn extract_code(raw: &str) -> Result<String, SandboxError> {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        // Skip the language tag (rest of the opening line)
        let body = match after_fence.find('\n') {
            Some(newline) => &after_fence[newline + 1..],
            None => return Err(SandboxError::MalformedCode("unterminated code fence".into())),
        };
        let end = body
            .find("```")
            .ok_or_else(|| SandboxError::MalformedCode("unterminated code fence".into()))?;
        return non_empty(&body[..end]);
    }

    if let Some(start) = trimmed.find("<code>") {
        let body = &trimmed[start + "<code>".len()..];
        let end = body
            .find("</code>")
            .ok_or_else(|| SandboxError::MalformedCode("missing </code>".into()))?;
        return non_empty(&body[..end]);
    }

    non_empty(trimmed)
}

fn non_empty(code: &str) -> Result<String, SandboxError> {
    let code = code.trim();
    if code.is_empty() {
        return Err(SandboxError::NoCode);
    }
    Ok(code.to_string())
}

/// Split `chart_12.png` into `(Some(12), "png")`
fn numbered_parts(filename: &str) -> (Option<u64>, String) {
    let (stem, ext) = filename.rsplit_once('.').unwrap_or((filename, ""));
    let digits: String = stem
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    (digits.parse().ok(), ext.to_ascii_lowercase())
}

/// Find the output belonging to `filename`.
///
/// An exact filename match wins. Otherwise an output with the same numeric
/// suffix and extension is accepted (`plot_2.png` for `chart_2.png`).
pub fn match_output<'a>(outputs: &'a [SandboxOutput], filename: &str) -> Option<&'a SandboxOutput> {
    if let Some(exact) = outputs.iter().find(|o| o.filename() == Some(filename)) {
        return Some(exact);
    }

    let (number, ext) = numbered_parts(filename);
    let number = number?;
    outputs.iter().find(|output| {
        output
            .filename()
            .map(numbered_parts)
            .map(|(n, e)| n == Some(number) && e == ext)
            .unwrap_or(false)
    })
}
