//! Source payload decoding (RSS feeds, paged JSON APIs) and the listing parser/classifier.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rjip_core::{
    ApiItem, ApiMapping, CanonicalListing, ContractType, ExperienceLevel, FeedItem,
    RawSourceItem, RemoteType, SourceDescriptor, SourceKind,
};
use rjip_storage::{sha256_hex, FetchError, SourceFetcher};
use scraper::Html;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rjip-adapters";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed feed xml from {source_id}: {message}")]
    Xml { source_id: String, message: String },
    #[error("malformed json from {source_id}: {message}")]
    Json { source_id: String, message: String },
    #[error("{source_id}: list path `{path}` does not resolve to an array")]
    ListPath { source_id: String, path: String },
    #[error("{source_id} is a paged api source without an api mapping")]
    MissingMapping { source_id: String },
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl AdapterError {
    /// Fetch errors arrive with the fetcher's retries already spent. A malformed payload may
    /// be a truncated or maintenance response and is worth another task attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Parse(_))
    }
}

#[derive(Debug, Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Default)]
pub struct FetchedItems {
    pub items: Vec<RawSourceItem>,
    pub pages: usize,
    pub elapsed: Duration,
    /// Set when a later page failed and pagination ended early.
    pub page_error: Option<String>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn decode(
        &self,
        source: &SourceDescriptor,
        body: &str,
    ) -> Result<Vec<RawSourceItem>, ParseError>;

    /// Reads every fetch target of `source` in order, capped at `max_items_per_source`.
    /// Pagination stops early at the first page that decodes to no items. A failure after
    /// items were collected ends pagination and keeps those items, noting the error in
    /// `page_error`.
    async fn fetch_items(
        &self,
        http: &dyn SourceFetcher,
        ctx: &AdapterContext,
        source: &SourceDescriptor,
    ) -> Result<FetchedItems, AdapterError> {
        let mut out = FetchedItems::default();
        for url in source.fetch_targets() {
            let page = match http
                .fetch_text(ctx.run_id, &source.id, &url, &ctx.cancel)
                .await
            {
                Ok(resp) => {
                    out.pages += 1;
                    out.elapsed += resp.elapsed;
                    self.decode(source, &resp.body).map_err(AdapterError::from)
                }
                Err(err) => Err(AdapterError::from(err)),
            };

            let items = match page {
                Ok(items) => items,
                Err(err) if out.items.is_empty() => return Err(err),
                Err(err) => {
                    warn!(
                        source_id = %source.id,
                        url = %url,
                        kept = out.items.len(),
                        error = %err,
                        "page failed; keeping items from earlier pages"
                    );
                    out.page_error = Some(format!("{url}: {err}"));
                    break;
                }
            };
            if items.is_empty() {
                debug!(source_id = %source.id, url = %url, "empty page; stopping");
                break;
            }
            let room = source.max_items_per_source.saturating_sub(out.items.len());
            out.items.extend(items.into_iter().take(room));
            if out.items.len() >= source.max_items_per_source {
                break;
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FeedAdapter;

#[derive(Debug, Clone, Copy, Default)]
pub struct PagedApiAdapter;

static FEED_ADAPTER: FeedAdapter = FeedAdapter;
static PAGED_API_ADAPTER: PagedApiAdapter = PagedApiAdapter;

pub fn adapter_for_kind(kind: SourceKind) -> &'static dyn SourceAdapter {
    match kind {
        SourceKind::Feed => &FEED_ADAPTER,
        SourceKind::PagedApi => &PAGED_API_ADAPTER,
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::Feed
    }

    fn decode(
        &self,
        source: &SourceDescriptor,
        body: &str,
    ) -> Result<Vec<RawSourceItem>, ParseError> {
        decode_feed(&source.id, body)
    }
}

#[async_trait]
impl SourceAdapter for PagedApiAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::PagedApi
    }

    fn decode(
        &self,
        source: &SourceDescriptor,
        body: &str,
    ) -> Result<Vec<RawSourceItem>, ParseError> {
        let mapping = source
            .api
            .as_ref()
            .ok_or_else(|| ParseError::MissingMapping {
                source_id: source.id.clone(),
            })?;
        decode_api_page(&source.id, mapping, body)
    }
}

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    title: Option<String>,
    #[serde(rename = "link", default)]
    links: Vec<TextNode>,
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Default, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    title: Option<String>,
    #[serde(rename = "link", default)]
    links: Vec<TextNode>,
    guid: Option<TextNode>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    #[serde(rename = "creator", alias = "dc:creator")]
    creator: Option<String>,
    #[serde(rename = "category", default)]
    categories: Vec<TextNode>,
    description: Option<String>,
    #[serde(rename = "encoded", alias = "content:encoded")]
    content: Option<String>,
}

fn first_text(nodes: &[TextNode]) -> Option<String> {
    nodes
        .iter()
        .filter_map(|n| n.value.as_deref())
        .find_map(|v| text_or_none(v.to_string()))
}

const XML_ENTITIES: &[&str] = &["amp", "lt", "gt", "quot", "apos"];

static ENTITY_OR_AMPERSAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]+;|#[xX][0-9a-fA-F]+;|[A-Za-z][A-Za-z0-9]*;)?")
        .expect("valid entity pattern")
});

/// Rewrites what XML rejects: HTML named entities are decoded, unknown names and bare `&` are
/// escaped. Numeric references and the five XML entities pass through.
fn scrub_html_entities_for_xml(s: &str) -> String {
    let s = s
        .replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&hellip;", "...")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'");
    ENTITY_OR_AMPERSAND
        .replace_all(&s, |caps: &Captures| {
            let Some(entity) = caps.get(1) else {
                return "&amp;".to_string();
            };
            let name = entity.as_str().trim_end_matches(';');
            if name.starts_with('#') || XML_ENTITIES.contains(&name) {
                return caps[0].to_string();
            }
            let decoded = html_escape::decode_html_entities(&caps[0]);
            if decoded == caps[0] {
                format!("&amp;{name};")
            } else {
                html_escape::encode_text(&decoded).into_owned()
            }
        })
        .into_owned()
}

pub fn decode_feed(source_id: &str, body: &str) -> Result<Vec<RawSourceItem>, ParseError> {
    let xml = scrub_html_entities_for_xml(body);
    let rss: Rss = quick_xml::de::from_str(&xml).map_err(|err| ParseError::Xml {
        source_id: source_id.to_string(),
        message: err.to_string(),
    })?;

    let feed_title = rss.channel.title.and_then(text_or_none);
    let feed_link = first_text(&rss.channel.links);

    Ok(rss
        .channel
        .items
        .into_iter()
        .map(|item| {
            RawSourceItem::Feed(FeedItem {
                title: item.title.and_then(text_or_none),
                link: first_text(&item.links),
                guid: item.guid.and_then(|g| g.value).and_then(text_or_none),
                creator: item.creator.and_then(text_or_none),
                published: item.pub_date.and_then(text_or_none),
                categories: item
                    .categories
                    .iter()
                    .filter_map(|c| c.value.clone().and_then(text_or_none))
                    .collect(),
                snippet: item.description,
                content: item.content,
                feed_title: feed_title.clone(),
                feed_link: feed_link.clone(),
            })
        })
        .collect())
}

fn json_lookup<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

fn json_text(value: &JsonValue, path: &str) -> Option<String> {
    match json_lookup(value, path)? {
        JsonValue::String(s) => text_or_none(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn json_f64(value: &JsonValue, path: &str) -> Option<f64> {
    let number = match json_lookup(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.replace(',', "").trim().parse::<f64>().ok(),
        _ => None,
    }?;
    (number > 0.0).then_some(number)
}

fn json_string_vec(value: &JsonValue, path: &str) -> Vec<String> {
    match json_lookup(value, path) {
        Some(JsonValue::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .filter_map(text_or_none)
            .collect(),
        Some(JsonValue::String(s)) => s
            .split(',')
            .filter_map(|part| text_or_none(part.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

/// Decodes one JSON API page into raw items using the source's field mapping.
pub fn decode_api_page(
    source_id: &str,
    mapping: &ApiMapping,
    body: &str,
) -> Result<Vec<RawSourceItem>, ParseError> {
    let payload: JsonValue = serde_json::from_str(body).map_err(|err| ParseError::Json {
        source_id: source_id.to_string(),
        message: err.to_string(),
    })?;

    let list = if mapping.list_path == "$" {
        Some(&payload)
    } else {
        json_lookup(&payload, &mapping.list_path)
    };
    let Some(records) = list.and_then(JsonValue::as_array) else {
        return Err(ParseError::ListPath {
            source_id: source_id.to_string(),
            path: mapping.list_path.clone(),
        });
    };

    let fields = &mapping.fields;
    let key = |field: &Option<String>, default: &'static str| -> String {
        field.clone().unwrap_or_else(|| default.to_string())
    };
    let id_key = key(&fields.id, "id");
    let title_key = key(&fields.title, "title");
    let link_key = key(&fields.link, "url");
    let company_key = key(&fields.company, "company");
    let logo_key = key(&fields.company_logo, "company_logo");
    let location_key = key(&fields.location, "location");
    let published_key = key(&fields.published, "date");
    let categories_key = key(&fields.categories, "category");
    let tags_key = key(&fields.tags, "tags");
    let description_key = key(&fields.description, "description");
    let salary_key = key(&fields.salary, "salary");
    let salary_min_key = key(&fields.salary_min, "salary_min");
    let salary_max_key = key(&fields.salary_max, "salary_max");
    let currency_key = key(&fields.currency, "currency");

    Ok(records
        .iter()
        .filter(|record| record.is_object())
        .filter(|record| {
            mapping
                .skip_meta_key
                .as_deref()
                .map_or(true, |meta| record.get(meta).is_none())
        })
        .map(|record| {
            RawSourceItem::Api(ApiItem {
                id: json_text(record, &id_key),
                title: json_text(record, &title_key),
                link: json_text(record, &link_key),
                company: json_text(record, &company_key),
                company_logo: json_text(record, &logo_key),
                location: json_text(record, &location_key),
                published: json_text(record, &published_key),
                categories: json_string_vec(record, &categories_key),
                tags: json_string_vec(record, &tags_key),
                snippet: json_text(record, &description_key),
                salary_text: json_text(record, &salary_key),
                salary_min: json_f64(record, &salary_min_key),
                salary_max: json_f64(record, &salary_max_key),
                currency: json_text(record, &currency_key),
            })
        })
        .collect())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Flattens an HTML fragment to whitespace-normalized plain text.
pub fn html_to_text(fragment: &str) -> String {
    let document = Html::parse_fragment(fragment);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn keyword_table(patterns: &[&str]) -> Regex {
    let joined = patterns.join("|");
    Regex::new(&format!(r"\b(?:{joined})\b")).expect("keyword table is a valid pattern")
}

static CONTRACT_RULES: Lazy<Vec<(Regex, ContractType)>> = Lazy::new(|| {
    vec![
        (
            keyword_table(&["intern", "internship", "trainee", "praksa", "stručna praksa"]),
            ContractType::Internship,
        ),
        (
            keyword_table(&["contract", "contractor", "b2b", "ugovor o delu"]),
            ContractType::Contract,
        ),
        (
            keyword_table(&["freelance", "freelancer", "gig", "honorarno", "honorarni"]),
            ContractType::Freelance,
        ),
        (
            keyword_table(&[
                r"part[\s-]?time",
                "pola radnog vremena",
                "nepuno radno vreme",
                "skraćeno radno vreme",
            ]),
            ContractType::PartTime,
        ),
    ]
});

static EXPERIENCE_RULES: Lazy<Vec<(Regex, ExperienceLevel)>> = Lazy::new(|| {
    vec![
        (
            keyword_table(&["principal", "staff engineer", "director", "head of", "cto", "direktor"]),
            ExperienceLevel::Executive,
        ),
        (
            keyword_table(&["lead", "tech lead", "team lead", "vođa tima", "vodja tima", "rukovodilac"]),
            ExperienceLevel::Lead,
        ),
        (
            keyword_table(&["senior", "sr", "iskusan", "iskusni"]),
            ExperienceLevel::Senior,
        ),
        (
            keyword_table(&["mid", "mid-level", "intermediate", "medior", "regular"]),
            ExperienceLevel::Mid,
        ),
        (
            keyword_table(&[
                "junior", "jr", "entry", r"entry[\s-]level", "graduate", "intern", "internship",
                "trainee", "pripravnik", "početnik", "pocetnik", "mlađi", "mladji",
            ]),
            ExperienceLevel::Entry,
        ),
    ]
});

static REMOTE_RULES: Lazy<Vec<(Regex, RemoteType)>> = Lazy::new(|| {
    vec![
        (
            keyword_table(&["hybrid", "hibrid", "hibridno", "hibridni"]),
            RemoteType::Hybrid,
        ),
        (
            keyword_table(&[r"on[\s-]?site", r"in[\s-]office", r"office[\s-]based", "u kancelariji"]),
            RemoteType::OnSite,
        ),
        (
            keyword_table(&["flexible", r"remote[\s-]friendly", "fleksibilno", "fleksibilni"]),
            RemoteType::Flexible,
        ),
        (
            keyword_table(&["remote", "fully remote", "anywhere", "rad od kuće", "rad od kuce"]),
            RemoteType::FullyRemote,
        ),
    ]
});

/// First matching rule wins; full-time when nothing matches.
pub fn classify_contract_type(hints: &str) -> ContractType {
    CONTRACT_RULES
        .iter()
        .find(|(re, _)| re.is_match(hints))
        .map(|(_, value)| *value)
        .unwrap_or(ContractType::FullTime)
}

pub fn classify_experience_level(hints: &str) -> Option<ExperienceLevel> {
    EXPERIENCE_RULES
        .iter()
        .find(|(re, _)| re.is_match(hints))
        .map(|(_, value)| *value)
}

pub fn classify_remote_type(hints: &str, default: RemoteType) -> RemoteType {
    REMOTE_RULES
        .iter()
        .find(|(re, _)| re.is_match(hints))
        .map(|(_, value)| *value)
        .unwrap_or(default)
}

/// Accepts RFC 3339, RFC 2822, common naive date/datetime layouts (read as UTC), and unix
/// epochs in seconds or milliseconds.
pub fn coerce_date(raw: &str) -> Option<DateTime<Utc>> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(dt.with_timezone(&Utc));
    }
    for layout in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, layout) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    if let Ok(epoch) = value.parse::<i64>() {
        return if epoch.abs() >= 1_000_000_000_000 {
            DateTime::from_timestamp_millis(epoch)
        } else {
            DateTime::from_timestamp(epoch, 0)
        };
    }
    None
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalaryRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: Option<String>,
}

static SALARY_CURRENCY: Lazy<Regex> =
    Lazy::new(|| keyword_table(&["eur", "usd", "gbp", "rsd", "chf", "din"]));
static SALARY_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d[\d.,]*)\s*(k)?\b").expect("valid salary pattern"));

fn salary_currency(text: &str) -> Option<String> {
    if text.contains('€') {
        return Some("EUR".into());
    }
    if text.contains('£') {
        return Some("GBP".into());
    }
    if text.contains('$') {
        return Some("USD".into());
    }
    let lower = text.to_lowercase();
    SALARY_CURRENCY.find(&lower).map(|m| match m.as_str() {
        "din" => "RSD".to_string(),
        code => code.to_uppercase(),
    })
}

fn parse_salary_number(token: &str, thousands: bool) -> Option<f64> {
    let token = token.trim_end_matches(['.', ',']);
    let groups: Vec<&str> = token.split(['.', ',']).collect();
    let digits = match groups.as_slice() {
        [whole] => whole.to_string(),
        // A trailing group of exactly three digits means every separator groups thousands.
        [.., last] if last.len() == 3 => groups.concat(),
        [head @ .., last] => format!("{}.{}", head.concat(), last),
        [] => return None,
    };
    let value = digits.parse::<f64>().ok()?;
    Some(if thousands { value * 1000.0 } else { value })
}

/// Reads a free-text salary such as `"$80k - $120k"` or `"€1.500 - 2.000 / month"`.
pub fn parse_salary_loose(text: &str) -> SalaryRange {
    let currency = salary_currency(text);
    let numbers: Vec<f64> = SALARY_NUMBER
        .captures_iter(text)
        .filter_map(|caps| {
            let token = caps.get(1)?.as_str();
            parse_salary_number(token, caps.get(2).is_some())
        })
        .filter(|value| *value > 0.0)
        .take(2)
        .collect();

    let (min, max) = match numbers.as_slice() {
        [] => (None, None),
        [single] => (Some(*single), Some(*single)),
        [a, b, ..] => (Some(a.min(*b)), Some(a.max(*b))),
    };
    SalaryRange { min, max, currency }
}

/// `dc:creator` values look like "Jane Doe at Acme"; the company is the last segment.
fn company_from_creator(creator: &str) -> Option<String> {
    creator
        .rsplit(" at ")
        .next()
        .and_then(|c| text_or_none(c.to_string()))
}

fn merge_tags(source_tags: &[String], extra: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in source_tags.iter().cloned().chain(extra.into_iter().map(|t| t.to_lowercase())) {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}

fn external_id_for(native: Option<&str>, link: &str) -> String {
    native
        .and_then(|id| text_or_none(id.to_string()))
        .unwrap_or_else(|| sha256_hex(link.as_bytes()))
}

struct ListingParts {
    external_id: String,
    title: String,
    link: String,
    company: String,
    company_logo: Option<String>,
    location: Option<String>,
    description: Option<String>,
    hints: String,
    published: Option<String>,
    tags: Vec<String>,
    salary: SalaryRange,
    metadata: BTreeMap<String, JsonValue>,
}

fn assemble(source: &SourceDescriptor, parts: ListingParts) -> CanonicalListing {
    let remote_type = classify_remote_type(&parts.hints, source.default_remote_type);
    CanonicalListing {
        source_id: source.id.clone(),
        external_id: parts.external_id,
        title: parts.title,
        company: parts.company,
        company_logo: parts.company_logo,
        location: parts.location,
        contract_type: classify_contract_type(&parts.hints),
        category: source.category.clone(),
        description: parts.description,
        requirements: None,
        benefits: None,
        salary_min: parts.salary.min,
        salary_max: parts.salary.max,
        currency: parts.salary.currency,
        salary_min_eur: None,
        salary_max_eur: None,
        is_remote: remote_type.is_remote(),
        remote_type,
        experience_level: classify_experience_level(&parts.hints),
        posted_at: parts.published.as_deref().and_then(coerce_date),
        deadline: None,
        url: parts.link,
        source_url: source.endpoint.clone(),
        featured: false,
        tags: parts.tags,
        metadata: parts.metadata,
    }
}

fn hint_text<'a>(pieces: impl IntoIterator<Item = &'a str>) -> String {
    pieces
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn parse_feed_item(item: &FeedItem, source: &SourceDescriptor) -> Option<CanonicalListing> {
    let title = item.title.clone().and_then(text_or_none)?;
    let link = item.link.clone().and_then(text_or_none)?;
    let snippet = item.snippet.as_deref().map(html_to_text).unwrap_or_default();
    let content = item.content.as_deref().map(html_to_text).unwrap_or_default();
    let body = if snippet.is_empty() { &content } else { &snippet };
    if !source.filters.admits(&title, body) {
        return None;
    }

    let hints = hint_text(
        item.categories
            .iter()
            .map(String::as_str)
            .chain([snippet.as_str(), content.as_str()]),
    );
    let description = text_or_none(body.clone());
    let company = item
        .creator
        .as_deref()
        .and_then(company_from_creator)
        .or_else(|| item.feed_title.clone())
        .unwrap_or_else(|| source.name.clone());

    let mut metadata = BTreeMap::new();
    if let Some(feed_title) = &item.feed_title {
        metadata.insert("feed_title".to_string(), JsonValue::from(feed_title.clone()));
    }
    if let Some(feed_link) = &item.feed_link {
        metadata.insert("feed_link".to_string(), JsonValue::from(feed_link.clone()));
    }

    Some(assemble(
        source,
        ListingParts {
            external_id: external_id_for(item.guid.as_deref(), &link),
            title,
            link,
            company,
            company_logo: None,
            location: None,
            description,
            hints,
            published: item.published.clone(),
            tags: merge_tags(&source.tags, item.categories.iter().cloned()),
            salary: SalaryRange::default(),
            metadata,
        },
    ))
}

fn parse_api_item(item: &ApiItem, source: &SourceDescriptor) -> Option<CanonicalListing> {
    let title = item.title.clone().and_then(text_or_none)?;
    let link = item.link.clone().and_then(text_or_none)?;
    let snippet = item.snippet.as_deref().map(html_to_text).unwrap_or_default();
    if !source.filters.admits(&title, &snippet) {
        return None;
    }

    let hints = hint_text(
        item.categories
            .iter()
            .chain(item.tags.iter())
            .map(String::as_str)
            .chain(std::iter::once(snippet.as_str())),
    );

    let loose = item
        .salary_text
        .as_deref()
        .map(parse_salary_loose)
        .unwrap_or_default();
    let salary = SalaryRange {
        min: item.salary_min.or(loose.min),
        max: item.salary_max.or(loose.max),
        currency: item
            .currency
            .as_deref()
            .map(str::to_uppercase)
            .or(loose.currency),
    };

    let mut metadata = BTreeMap::new();
    if let Some(salary_text) = &item.salary_text {
        metadata.insert("salary_text".to_string(), JsonValue::from(salary_text.clone()));
    }

    Some(assemble(
        source,
        ListingParts {
            external_id: external_id_for(item.id.as_deref(), &link),
            title,
            link,
            company: item.company.clone().unwrap_or_else(|| source.name.clone()),
            company_logo: item.company_logo.clone(),
            location: item.location.clone(),
            description: text_or_none(snippet),
            hints,
            published: item.published.clone(),
            tags: merge_tags(
                &source.tags,
                item.categories.iter().chain(item.tags.iter()).cloned(),
            ),
            salary,
            metadata,
        },
    ))
}

/// Normalizes one raw item. `None` drops it silently: missing title or link, or rejected by
/// the source's include/exclude filters.
pub fn parse_listing(item: &RawSourceItem, source: &SourceDescriptor) -> Option<CanonicalListing> {
    match item {
        RawSourceItem::Feed(feed) => parse_feed_item(feed, source),
        RawSourceItem::Api(api) => parse_api_item(api, source),
    }
}
