/// Excludes logos, icons, vector art, banners, and building/signage shots.
pub const NEGATIVE_TERMS: &str = "-logo -logos -icon -icons -vector -clipart -illustration -banner -headquarters -building -sign -brand -ai -AI -Ai";

/// Upper bound on the quoted identifying term; long catalog descriptions are cut.
pub const MAX_TERM_CHARS: usize = 120;

/// Builds `[site:<host> ]"<manufacturer> <part|description>" <negative terms>`.
pub fn build_query(
    manufacturer: &str,
    part_number: Option<&str>,
    description: Option<&str>,
    scope: Option<&str>,
) -> String {
    let qualifier = part_number
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| description.map(str::trim).filter(|v| !v.is_empty()));

    let term = match qualifier {
        Some(qualifier) => format!("{} {}", manufacturer.trim(), qualifier),
        None => manufacturer.trim().to_string(),
    };
    let term: String = term
        .replace('"', "")
        .chars()
        .take(MAX_TERM_CHARS)
        .collect::<String>()
        .trim_end()
        .to_string();

    match scope.map(str::trim).filter(|v| !v.is_empty()) {
        Some(host) => format!("site:{host} \"{term}\" {NEGATIVE_TERMS}"),
        None => format!("\"{term}\" {NEGATIVE_TERMS}"),
    }
}
