//! File name helpers for the storage layout.

/// Percent-escape characters that cannot appear in a file name on common file systems.
/// See <https://en.wikipedia.org/wiki/Percent-encoding>.
/// `.`, `..` and the empty name are escaped as well so a name always stays one path component.
pub fn escape_file_name(name: &str) -> String {
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return name.replace('.', "%2E") + "%";
    }
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '%' => out.push_str("%25"),
            '\\' => out.push_str("%5C"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            '?' => out.push_str("%3F"),
            '"' => out.push_str("%22"),
            '<' => out.push_str("%3C"),
            '>' => out.push_str("%3E"),
            '|' => out.push_str("%7C"),
            c => out.push(c),
        }
    }
    out
}
