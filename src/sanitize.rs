//! Prompt text to single-line, filesystem- and metadata-safe strings.

/// Upper bound on the length of any sanitized string, in characters.
pub const MAX_SANITIZED_CHARS: usize = 1000;

/// Length of the prompt prefix embedded in frame and video file names.
pub const PROMPT_PREFIX_CHARS: usize = 96;

const LINE_SEPARATOR: &str = ", ";

/// Strips ASCII punctuation from every line, trims it, and joins the non-empty
/// lines with `", "`. The result is truncated to [`MAX_SANITIZED_CHARS`].
pub fn sanitize(text: &str) -> String {
    let joined = text
        .lines()
        .map(strip_punctuation)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(LINE_SEPARATOR);
    truncate_chars(&joined, MAX_SANITIZED_CHARS)
}

/// The sanitized prompt cut down to [`PROMPT_PREFIX_CHARS`], without trailing
/// whitespace so it can end a file name.
pub fn prompt_prefix(prompt: &str) -> String {
    truncate_chars(&sanitize(prompt), PROMPT_PREFIX_CHARS)
        .trim_end()
        .to_owned()
}

fn strip_punctuation(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .trim()
        .to_owned()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => text[..byte_index].to_owned(),
        None => text.to_owned(),
    }
}
