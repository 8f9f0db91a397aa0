use serde::Serialize;

/// A single aggregated headline.
///
/// `url` is the identity key: within one aggregated result no two items share it.
/// `published_at` is always in the canonical `YYYY-MM-DDTHH:MM:SSZ` form, so
/// comparing it as text orders items chronologically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewsItem {
    pub headline: String,
    pub summary: String,
    pub url: String,
    pub source: String,
    pub published_at: String,
}
