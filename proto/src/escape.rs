//! Per-dialect argument escaping. NMDC escapes three characters as HTML-style
//! entities because its own syntax is built from them; ADC escapes three
//! characters with backslash because its own syntax is space- and
//! newline-delimited.

/// Escape a value for inclusion in an NMDC command argument.
///
/// Order matters: `&` must be escaped first, or the entities this function
/// introduces for `$` and `|` would themselves be re-escaped.
pub fn nmdc_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('$', "&#36;")
        .replace('|', "&#124;")
}

/// Reverse [`nmdc_escape`].
pub fn nmdc_unescape(escaped: &str) -> String {
    escaped
        .replace("&#124;", "|")
        .replace("&#36;", "$")
        .replace("&amp;", "&")
}

/// Escape a value for inclusion in an ADC field.
pub fn adc_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            ' ' => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out
}

/// Reverse [`adc_escape`].
pub fn adc_unescape(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('s') => out.push(' '),
                Some('n') => out.push('\n'),
                Some('\\') => out.push('\\'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(ch);
        }
    }
    out
}
