pub mod extract;
pub mod query;

pub use extract::CandidateExtractor;
pub use query::build_query;

use url::Url;

/// Lowercase `host[:port]` of a URL. Bare hosts such as `acme.com` are read as https.
pub fn authority(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let parsed = if raw.contains("://") {
        Url::parse(raw).ok()?
    } else {
        Url::parse(&format!("https://{raw}")).ok()?
    };
    let host = parsed.host_str()?.to_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}
