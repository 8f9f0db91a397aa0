use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser::{self, ParseFeedError};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;

use crate::config::Source;
use crate::model::NewsItem;
use crate::normalize::{canonical_timestamp, normalize_text, strip_markup};

const USER_AGENT: &str = "Headlines/1.0 (RSS Aggregator)";

/// Connect timeout ceiling in seconds; the total fetch budget may be shorter.
const CONNECT_TIMEOUT_SECS: u64 = 5;

const MAX_REDIRECTS: usize = 5;

/// Why a single source contributed nothing to an aggregation run.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP error: {0}")]
    Status(StatusCode),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("malformed feed: {0}")]
    Malformed(String),
}

impl From<ParseFeedError> for FetchError {
    fn from(err: ParseFeedError) -> Self {
        FetchError::Malformed(err.to_string())
    }
}

impl FetchError {
    /// Short label for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout(_) => "timeout",
            FetchError::Status(_) => "status",
            FetchError::Request(_) => "transport",
            FetchError::Malformed(_) => "malformed",
        }
    }
}

/// Items parsed from one source, plus how many entries were skipped for
/// lacking a headline or link.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FetchedFeed {
    pub items: Vec<NewsItem>,
    pub dropped: usize,
}

/// Retrieves and parses one source.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, source: &Source) -> Result<FetchedFeed, FetchError>;
}

/// HTTP implementation of [`FeedFetcher`] backed by a shared reqwest client.
pub struct Fetcher {
    client: Client,
    timeout: Duration,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(CONNECT_TIMEOUT_SECS)))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self { client, timeout })
    }

    fn request_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            FetchError::Request(err)
        }
    }
}

#[async_trait]
impl FeedFetcher for Fetcher {
    async fn fetch(&self, source: &Source) -> Result<FetchedFeed, FetchError> {
        debug!("Fetching source: {} ({})", source.name, source.url);

        let response = self
            .client
            .get(&source.url)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status));
        }

        let bytes = response.bytes().await.map_err(|e| self.request_error(e))?;

        parse_feed(&source.name, &bytes, Utc::now())
    }
}

/// Parse raw feed bytes into items attributed to `source_name`.
///
/// A feed that is not well-formed or fails to parse is rejected as a whole.
/// Entries without a headline or link are skipped and counted in
/// [`FetchedFeed::dropped`]. `now` stands in for entries that carry no usable
/// timestamp.
pub fn parse_feed(
    source_name: &str,
    bytes: &[u8],
    now: DateTime<Utc>,
) -> Result<FetchedFeed, FetchError> {
    check_well_formed(bytes)?;
    let feed = parser::parse(bytes)?;

    let total = feed.entries.len();
    let items: Vec<NewsItem> = feed
        .entries
        .iter()
        .filter_map(|entry| entry_to_item(source_name, entry, now))
        .collect();

    Ok(FetchedFeed {
        dropped: total - items.len(),
        items,
    })
}

/// Reject XML documents with mismatched or unclosed elements.
///
/// The feed parser recovers from some of these and returns whatever entries it
/// read before the damage, so the whole document is checked first. JSON feeds
/// are left to the feed parser.
fn check_well_formed(bytes: &[u8]) -> Result<(), FetchError> {
    let body = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    if body.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
        return Ok(());
    }

    let mut reader = Reader::from_reader(body);
    let mut depth: usize = 0;
    loop {
        let event = reader.read_event().map_err(|e| {
            FetchError::Malformed(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;
        match event {
            Event::Start(_) => depth += 1,
            Event::End(_) => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    FetchError::Malformed(format!(
                        "unexpected closing tag at byte {}",
                        reader.buffer_position()
                    ))
                })?;
            }
            Event::Eof if depth > 0 => {
                return Err(FetchError::Malformed(format!(
                    "document ends with {} unclosed element(s)",
                    depth
                )));
            }
            Event::Eof => return Ok(()),
            _ => {}
        }
    }
}

pub fn entry_to_item(source_name: &str, entry: &Entry, now: DateTime<Utc>) -> Option<NewsItem> {
    let headline = entry
        .title
        .as_ref()
        .map(|t| strip_markup(&t.content))
        .unwrap_or_default();

    let Some(url) = entry_link(entry) else {
        debug!("Skipping entry with no link from '{}': {}", source_name, headline);
        return None;
    };

    if headline.is_empty() {
        debug!("Skipping entry with no title from '{}': {}", source_name, url);
        return None;
    }

    let summary = entry
        .summary
        .as_ref()
        .map(|s| s.content.as_str())
        .or_else(|| entry.content.as_ref().and_then(|c| c.body.as_deref()))
        .unwrap_or_default();

    Some(NewsItem {
        headline,
        summary: normalize_text(summary),
        url,
        source: source_name.to_string(),
        published_at: canonical_timestamp(entry.published, entry.updated, now),
    })
}

/// The article link of an entry: the first non-blank link that is not marked
/// as something other than `alternate` (enclosures, replies, self links).
pub fn entry_link(entry: &Entry) -> Option<String> {
    entry
        .links
        .iter()
        .filter(|link| {
            link.rel
                .as_deref()
                .map_or(true, |rel| rel.eq_ignore_ascii_case("alternate"))
        })
        .map(|link| link.href.trim())
        .find(|href| !href.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use feed_rs::model::Link;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 9, 18, 0, 0).unwrap()
    }

    fn create_test_entry(links: Vec<(&str, Option<&str>)>) -> Entry {
        Entry {
            id: "entry-1".to_string(),
            links: links
                .into_iter()
                .map(|(href, rel)| Link {
                    href: href.to_string(),
                    rel: rel.map(|r| r.to_string()),
                    media_type: None,
                    href_lang: None,
                    title: None,
                    length: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn rss(items: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
            <rss version="2.0">
                <channel>
                    <title>Self-Reported Title</title>
                    <link>https://markets.example.com</link>
                    <description>Market news</description>
                    {}
                </channel>
            </rss>"#,
            items
        )
    }

    mod entry_link_tests {
        use super::*;

        #[test]
        fn test_plain_link() {
            let entry = create_test_entry(vec![("https://article.com", None)]);
            assert_eq!(entry_link(&entry), Some("https://article.com".to_string()));
        }

        #[test]
        fn test_trims_whitespace() {
            let entry = create_test_entry(vec![("  https://article.com  ", None)]);
            assert_eq!(entry_link(&entry), Some("https://article.com".to_string()));
        }

        #[test]
        fn test_skips_non_alternate_rels() {
            let entry = create_test_entry(vec![
                ("https://cdn.example.com/audio.mp3", Some("enclosure")),
                ("https://article.com/comments", Some("replies")),
                ("https://article.com", Some("ALTERNATE")),
            ]);
            assert_eq!(entry_link(&entry), Some("https://article.com".to_string()));
        }

        #[test]
        fn test_skips_blank_href() {
            let entry = create_test_entry(vec![("   ", None), ("https://second.com", None)]);
            assert_eq!(entry_link(&entry), Some("https://second.com".to_string()));
        }

        #[test]
        fn test_no_links() {
            let entry = create_test_entry(vec![]);
            assert_eq!(entry_link(&entry), None);
        }

        #[test]
        fn test_entry_without_link_is_dropped() {
            let entry = create_test_entry(vec![("https://x.com/feed", Some("self"))]);
            assert_eq!(entry_to_item("Source", &entry, fixed_now()), None);
        }
    }

    mod parse_feed_tests {
        use super::*;

        #[test]
        fn test_parses_rss_items() {
            let xml = rss(r#"
                <item>
                    <title>Markets rally</title>
                    <link>https://markets.example.com/1</link>
                    <description>Stocks rose.</description>
                    <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                </item>
                <item>
                    <title>Bonds slip</title>
                    <link>https://markets.example.com/2</link>
                    <pubDate>Mon, 09 Dec 2024 10:00:00 GMT</pubDate>
                </item>
            "#);

            let fetched = parse_feed("Markets Wire", xml.as_bytes(), fixed_now()).unwrap();

            assert_eq!(fetched.dropped, 0);
            assert_eq!(fetched.items.len(), 2);

            let first = &fetched.items[0];
            assert_eq!(first.headline, "Markets rally");
            assert_eq!(first.url, "https://markets.example.com/1");
            assert_eq!(first.summary, "Stocks rose.");
            assert_eq!(first.published_at, "2024-12-09T12:00:00Z");

            assert_eq!(fetched.items[1].summary, "");
            assert_eq!(fetched.items[1].published_at, "2024-12-09T10:00:00Z");
        }

        #[test]
        fn test_source_is_configured_name() {
            let xml = rss(r#"
                <item>
                    <title>Headline</title>
                    <link>https://markets.example.com/1</link>
                </item>
            "#);

            let fetched = parse_feed("Configured Name", xml.as_bytes(), fixed_now()).unwrap();
            assert_eq!(fetched.items[0].source, "Configured Name");
        }

        #[test]
        fn test_filters_incomplete_entries() {
            let xml = rss(r#"
                <item>
                    <title></title>
                    <link>https://markets.example.com/u2</link>
                </item>
                <item>
                    <title>B</title>
                    <link></link>
                </item>
                <item>
                    <title>C</title>
                    <link>https://markets.example.com/u3</link>
                </item>
            "#);

            let fetched = parse_feed("Markets Wire", xml.as_bytes(), fixed_now()).unwrap();

            assert_eq!(fetched.items.len(), 1);
            assert_eq!(fetched.items[0].headline, "C");
            assert_eq!(fetched.items[0].url, "https://markets.example.com/u3");
            assert_eq!(fetched.dropped, 2);
        }

        #[test]
        fn test_missing_timestamp_uses_now() {
            let xml = rss(r#"
                <item>
                    <title>A</title>
                    <link>https://markets.example.com/u1</link>
                </item>
            "#);

            let fetched = parse_feed("Markets Wire", xml.as_bytes(), fixed_now()).unwrap();
            assert_eq!(fetched.items[0].published_at, "2024-12-09T18:00:00Z");
        }

        #[test]
        fn test_summary_markup_is_cleaned() {
            let xml = rss(r#"
                <item>
                    <title>Rates</title>
                    <link>https://markets.example.com/rates</link>
                    <description><![CDATA[<p>Rates &amp; <b>bonds</b></p>
                        <img src="chart.png"/>]]></description>
                </item>
            "#);

            let fetched = parse_feed("Markets Wire", xml.as_bytes(), fixed_now()).unwrap();
            assert_eq!(fetched.items[0].summary, "Rates & bonds");
        }

        #[test]
        fn test_atom_updated_fallback() {
            let xml = r#"<?xml version="1.0" encoding="utf-8"?>
                <feed xmlns="http://www.w3.org/2005/Atom">
                    <title>Atom Source</title>
                    <id>urn:uuid:feed</id>
                    <updated>2024-12-09T08:00:00Z</updated>
                    <entry>
                        <title>Only updated</title>
                        <id>urn:uuid:entry-1</id>
                        <link href="https://atom.example.com/1"/>
                        <updated>2024-12-09T07:30:00+01:00</updated>
                        <summary>Atom summary</summary>
                    </entry>
                </feed>"#;

            let fetched = parse_feed("Atom Source", xml.as_bytes(), fixed_now()).unwrap();

            assert_eq!(fetched.items.len(), 1);
            assert_eq!(fetched.items[0].url, "https://atom.example.com/1");
            assert_eq!(fetched.items[0].published_at, "2024-12-09T06:30:00Z");
            assert_eq!(fetched.items[0].summary, "Atom summary");
        }

        #[test]
        fn test_double_escaped_summary_is_cleaned() {
            let xml = rss(r#"
                <item>
                    <title>Escaped</title>
                    <link>https://markets.example.com/escaped</link>
                    <description>&amp;lt;p&amp;gt;Hi&amp;lt;/p&amp;gt;</description>
                </item>
            "#);

            let fetched = parse_feed("Markets Wire", xml.as_bytes(), fixed_now()).unwrap();
            assert_eq!(fetched.items[0].summary, "Hi");
            assert!(!fetched.items[0].summary.contains('<'));
        }

        #[test]
        fn test_malformed_feed_is_rejected() {
            let result = parse_feed("Broken", b"this is not a feed", fixed_now());
            assert!(matches!(result, Err(FetchError::Malformed(_))));
        }

        #[test]
        fn test_mismatched_tags_reject_whole_feed() {
            let xml = rss(r#"
                <item>
                    <title>A</title>
                    <link>https://markets.example.com/u1</link>
                </item>
                <item>
                    <title>B</link>
                </item>
            "#);

            let result = parse_feed("Broken", xml.as_bytes(), fixed_now());
            assert!(matches!(result, Err(FetchError::Malformed(_))), "got {:?}", result);
        }

        #[test]
        fn test_truncated_feed_is_rejected() {
            let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
                <rss version="2.0"><channel><title>Cut</title>
                <item><title>A</title><link>https://markets.example.com/u1</link></item>
                <item><title>B</title>"#;

            let result = parse_feed("Cut", xml.as_bytes(), fixed_now());
            assert!(matches!(result, Err(FetchError::Malformed(_))), "got {:?}", result);
        }

        #[test]
        fn test_json_feed_skips_xml_check() {
            let json = r#"{
                "version": "https://jsonfeed.org/version/1.1",
                "title": "Json Source",
                "items": [
                    {"id": "1", "url": "https://json.example.com/1", "title": "Json headline"}
                ]
            }"#;

            let fetched = parse_feed("Json Source", json.as_bytes(), fixed_now()).unwrap();
            assert_eq!(fetched.items.len(), 1);
            assert_eq!(fetched.items[0].headline, "Json headline");
        }

        #[test]
        fn test_empty_channel() {
            let fetched = parse_feed("Empty", rss("").as_bytes(), fixed_now()).unwrap();
            assert_eq!(fetched, FetchedFeed::default());
        }
    }

    mod http_fetch_tests {
        use super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        async fn serve(template: ResponseTemplate) -> MockServer {
            let server = MockServer::start().await;
            Mock::given(method("GET"))
                .and(path("/rss"))
                .respond_with(template)
                .mount(&server)
                .await;
            server
        }

        fn source_for(server: &MockServer) -> Source {
            Source::new("Mock", format!("{}/rss", server.uri()))
        }

        #[tokio::test]
        async fn test_fetch_success() {
            let body = rss(r#"
                <item>
                    <title>Fetched headline</title>
                    <link>https://markets.example.com/fetched</link>
                    <pubDate>Mon, 09 Dec 2024 12:00:00 GMT</pubDate>
                </item>
            "#);
            let server = serve(ResponseTemplate::new(200).set_body_string(body)).await;
            let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();

            let fetched = fetcher.fetch(&source_for(&server)).await.unwrap();

            assert_eq!(fetched.items.len(), 1);
            assert_eq!(fetched.items[0].headline, "Fetched headline");
            assert_eq!(fetched.items[0].source, "Mock");
        }

        #[tokio::test]
        async fn test_fetch_non_success_status() {
            let server = serve(ResponseTemplate::new(503)).await;
            let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();

            let err = fetcher.fetch(&source_for(&server)).await.unwrap_err();

            assert!(matches!(err, FetchError::Status(s) if s == StatusCode::SERVICE_UNAVAILABLE));
            assert_eq!(err.kind(), "status");
        }

        #[tokio::test]
        async fn test_fetch_timeout() {
            let template = ResponseTemplate::new(200)
                .set_body_string(rss(""))
                .set_delay(Duration::from_secs(2));
            let server = serve(template).await;
            let fetcher = Fetcher::new(Duration::from_millis(200)).unwrap();

            let err = fetcher.fetch(&source_for(&server)).await.unwrap_err();

            assert!(matches!(err, FetchError::Timeout(_)), "got {:?}", err);
        }

        #[tokio::test]
        async fn test_fetch_malformed_body() {
            let server =
                serve(ResponseTemplate::new(200).set_body_string("this is not a feed")).await;
            let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();

            let err = fetcher.fetch(&source_for(&server)).await.unwrap_err();

            assert_eq!(err.kind(), "malformed");
        }

        #[tokio::test]
        async fn test_fetch_unreachable() {
            let fetcher = Fetcher::new(Duration::from_secs(2)).unwrap();
            let source = Source::new("Nowhere", "http://127.0.0.1:1/rss");

            let err = fetcher.fetch(&source).await.unwrap_err();

            assert_eq!(err.kind(), "transport");
        }
    }
}
