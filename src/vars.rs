//! `${name}` placeholder expansion for template task lines.

/// Expand every `${name}` span in `input` using `lookup`.
///
/// Scanning resumes after the inserted text, so a substituted value is never
/// itself expanded. Names `lookup` does not know resolve to an empty string.
/// An opening `${` without a closing `}` is left untouched along with the rest
/// of the input.
pub fn expand<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let name = &rest[start + 2..start + 2 + len];
        out.push_str(&rest[..start]);
        out.push_str(&lookup(name).unwrap_or_default());
        rest = &rest[start + 2 + len + 1..];
    }

    out.push_str(rest);
    out
}
