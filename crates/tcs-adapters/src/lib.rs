//! Source parser contracts + the FIDE and federation implementations.

use scraper::{ElementRef, Html, Selector};
use serde_json::Value as JsonValue;
use tcs_core::{normalize_whitespace, ParsedTournament, RawPayload, SourceKind};
use thiserror::Error;
use tracing::debug;
use url::Url;

mod dates;

pub use dates::{parse_date_range, parse_single_date};

pub const CRATE_NAME: &str = "tcs-adapters";

/// Names shorter than this are treated as scraping debris.
const MIN_NAME_CHARS: usize = 3;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("unexpected payload shape: {0}")]
    UnexpectedShape(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutput {
    pub candidates: Vec<ParsedTournament>,
    /// Entries dropped because they were individually malformed.
    pub skipped: usize,
}

/// Source-specific extraction behind one shared contract.
pub trait TournamentParser: Send + Sync {
    fn kind(&self) -> SourceKind;

    fn parse(&self, payload: &RawPayload) -> Result<ParseOutput, ParseError>;
}

/// Where one source keeps each field in its markup.
struct HtmlLayout {
    containers: &'static [&'static str],
    name: &'static [&'static str],
    dates: &'static str,
    location: &'static str,
    default_location: &'static str,
    category: &'static str,
    default_category: &'static str,
    id_attrs: &'static [&'static str],
    id_query_params: &'static [&'static str],
    id_prefix: &'static str,
}

const FIDE_LAYOUT: HtmlLayout = HtmlLayout {
    containers: &[
        "div.tournament-item",
        "div.event-item",
        "div.tournament-card",
        "article.tournament",
    ],
    name: &["h3", "h2", "h4", ".title", ".name"],
    dates: ".date, .dates, time",
    location: ".location, .venue, .city",
    default_location: "International",
    category: ".category, .type",
    default_category: "Open",
    id_attrs: &["data-event-id", "data-id"],
    id_query_params: &["id", "event"],
    id_prefix: "",
};

const FEDERATION_LAYOUT: HtmlLayout = HtmlLayout {
    containers: &[
        "div.event-item",
        "div.tournament-card",
        "article.news-item",
        ".events-list .event",
    ],
    name: &["h4", "h3", "h2", ".title", ".name"],
    dates: ".date, .time",
    location: ".location, .city",
    default_location: "Россия",
    category: ".category",
    default_category: "National",
    id_attrs: &["data-tournament-id"],
    id_query_params: &[],
    id_prefix: "rcf:",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipReason {
    MissingName,
    MissingDates,
    UnparsableDates,
    BlankLocation,
    NotAnObject,
}

fn selector(css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::Selector {
        selector: css.to_string(),
        message: e.to_string(),
    })
}

fn text_or_none(value: &str) -> Option<String> {
    let normalized = normalize_whitespace(value);
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(&element.text().collect::<String>())
}

fn decode_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    text.trim_start_matches('\u{feff}').to_string()
}

fn looks_like_json(payload: &RawPayload, text: &str) -> bool {
    let declared = payload
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("json"));
    let trimmed = text.trim_start();
    declared || trimmed.starts_with('{') || trimmed.starts_with('[')
}

fn resolve_link(base: Option<&Url>, href: &str) -> Option<Url> {
    match base {
        Some(base) => base.join(href).ok(),
        None => Url::parse(href).ok(),
    }
}

fn body_text(payload: &RawPayload) -> Result<String, ParseError> {
    let text = decode_body(&payload.body);
    if text.trim().is_empty() {
        return Err(ParseError::EmptyPayload);
    }
    Ok(text)
}

struct CompiledLayout<'a> {
    layout: &'a HtmlLayout,
    containers: Vec<Selector>,
    name: Vec<Selector>,
    dates: Selector,
    location: Selector,
    category: Selector,
    link: Selector,
}

impl<'a> CompiledLayout<'a> {
    fn new(layout: &'a HtmlLayout) -> Result<Self, ParseError> {
        Ok(Self {
            layout,
            containers: layout
                .containers
                .iter()
                .map(|css| selector(css))
                .collect::<Result<_, _>>()?,
            name: layout
                .name
                .iter()
                .map(|css| selector(css))
                .collect::<Result<_, _>>()?,
            dates: selector(layout.dates)?,
            location: selector(layout.location)?,
            category: selector(layout.category)?,
            link: selector("a[href]")?,
        })
    }

    fn entry(
        &self,
        entry: ElementRef<'_>,
        base: Option<&Url>,
        page_url: &str,
    ) -> Result<ParsedTournament, SkipReason> {
        let name = self
            .name
            .iter()
            .find_map(|sel| entry.select(sel).find_map(element_text))
            .filter(|n| n.chars().count() >= MIN_NAME_CHARS)
            .ok_or(SkipReason::MissingName)?;

        let dates_text = entry
            .select(&self.dates)
            .next()
            .and_then(|el| {
                element_text(el).or_else(|| el.value().attr("datetime").and_then(text_or_none))
            })
            .ok_or(SkipReason::MissingDates)?;
        let (start_date, end_date) =
            parse_date_range(&dates_text).ok_or(SkipReason::UnparsableDates)?;

        let location = match entry.select(&self.location).next() {
            Some(el) => element_text(el).ok_or(SkipReason::BlankLocation)?,
            None => self.layout.default_location.to_string(),
        };
        let category = entry
            .select(&self.category)
            .next()
            .and_then(element_text)
            .unwrap_or_else(|| self.layout.default_category.to_string());

        let link = entry
            .select(&self.link)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_link(base, href.trim()));

        let external_id = self
            .layout
            .id_attrs
            .iter()
            .find_map(|attr| entry.value().attr(attr).and_then(text_or_none))
            .or_else(|| {
                let link = link.as_ref()?;
                link.query_pairs().find_map(|(key, value)| {
                    self.layout
                        .id_query_params
                        .iter()
                        .any(|param| key == *param)
                        .then(|| text_or_none(&value))
                        .flatten()
                })
            })
            .map(|id| format!("{}{}", self.layout.id_prefix, id));

        Ok(ParsedTournament {
            external_id,
            name,
            location,
            category,
            start_date,
            end_date,
            source_url: link
                .map(|l| l.to_string())
                .unwrap_or_else(|| page_url.to_string()),
        })
    }
}

fn parse_html(
    kind: SourceKind,
    layout: &HtmlLayout,
    payload: &RawPayload,
    text: &str,
) -> Result<ParseOutput, ParseError> {
    let compiled = CompiledLayout::new(layout)?;
    let document = Html::parse_document(text);
    let base = Url::parse(&payload.url).ok();

    // The first container style that yields a tournament defines the page layout.
    // When every style only matches debris, the first match reports its skips.
    let mut fallback = None;
    for (style, container) in compiled.containers.iter().enumerate() {
        let entries = document.select(container).collect::<Vec<_>>();
        if entries.is_empty() {
            continue;
        }

        let mut out = ParseOutput::default();
        for (index, entry) in entries.into_iter().enumerate() {
            match compiled.entry(entry, base.as_ref(), &payload.url) {
                Ok(candidate) => out.candidates.push(candidate),
                Err(reason) => {
                    debug!(
                        source_kind = %kind,
                        style,
                        index,
                        ?reason,
                        "skipping malformed entry"
                    );
                    out.skipped += 1;
                }
            }
        }
        if !out.candidates.is_empty() {
            return Ok(out);
        }
        fallback.get_or_insert(out);
    }

    fallback.ok_or_else(|| {
        ParseError::UnexpectedShape(format!("no {kind} tournament entries found in HTML payload"))
    })
}

fn json_text(value: &JsonValue, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn json_entry(
    entry: &JsonValue,
    base: Option<&Url>,
    page_url: &str,
) -> Result<ParsedTournament, SkipReason> {
    if !entry.is_object() {
        return Err(SkipReason::NotAnObject);
    }
    let name = json_text(entry, &["name", "title"])
        .filter(|n| n.chars().count() >= MIN_NAME_CHARS)
        .ok_or(SkipReason::MissingName)?;

    let start = json_text(entry, &["start", "start_date", "date_start"]);
    let end = json_text(entry, &["end", "end_date", "date_end"]);
    let (start_date, end_date) = match (start, end) {
        (Some(start), end) => {
            let start = parse_single_date(&start).ok_or(SkipReason::UnparsableDates)?;
            let end = match end {
                Some(end) => parse_single_date(&end).ok_or(SkipReason::UnparsableDates)?,
                None => start,
            };
            (start, end)
        }
        (None, _) => {
            let dates = json_text(entry, &["dates"]).ok_or(SkipReason::MissingDates)?;
            parse_date_range(&dates).ok_or(SkipReason::UnparsableDates)?
        }
    };
    if start_date > end_date {
        return Err(SkipReason::UnparsableDates);
    }

    let location = match entry.get("location").or_else(|| entry.get("city")) {
        Some(_) => json_text(entry, &["location", "city"]).ok_or(SkipReason::BlankLocation)?,
        None => FIDE_LAYOUT.default_location.to_string(),
    };
    let category = json_text(entry, &["category", "type"])
        .unwrap_or_else(|| FIDE_LAYOUT.default_category.to_string());
    let source_url = json_text(entry, &["url", "link"])
        .and_then(|href| resolve_link(base, &href))
        .map(|u| u.to_string())
        .unwrap_or_else(|| page_url.to_string());

    Ok(ParsedTournament {
        external_id: json_text(entry, &["id", "event_id"]),
        name,
        location,
        category,
        start_date,
        end_date,
        source_url,
    })
}

fn parse_json_feed(payload: &RawPayload, text: &str) -> Result<ParseOutput, ParseError> {
    let value: JsonValue = serde_json::from_str(text)?;
    let entries = match &value {
        JsonValue::Array(items) => items,
        JsonValue::Object(map) => ["events", "tournaments", "data"]
            .iter()
            .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
            .ok_or_else(|| {
                ParseError::UnexpectedShape("JSON object has no events array".to_string())
            })?,
        _ => {
            return Err(ParseError::UnexpectedShape(
                "top-level JSON is neither an array nor an object".to_string(),
            ))
        }
    };

    let base = Url::parse(&payload.url).ok();
    let mut out = ParseOutput::default();
    for (index, entry) in entries.iter().enumerate() {
        match json_entry(entry, base.as_ref(), &payload.url) {
            Ok(candidate) => out.candidates.push(candidate),
            Err(reason) => {
                debug!(source_kind = "fide", index, ?reason, "skipping malformed feed entry");
                out.skipped += 1;
            }
        }
    }
    Ok(out)
}

/// FIDE calendar: HTML listing, or its JSON feed variant.
#[derive(Debug, Clone, Copy, Default)]
pub struct FideParser;

impl TournamentParser for FideParser {
    fn kind(&self) -> SourceKind {
        SourceKind::Fide
    }

    fn parse(&self, payload: &RawPayload) -> Result<ParseOutput, ParseError> {
        let text = body_text(payload)?;
        if looks_like_json(payload, &text) {
            return parse_json_feed(payload, &text);
        }
        parse_html(SourceKind::Fide, &FIDE_LAYOUT, payload, &text)
    }
}

/// National federation site listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct FederationParser;

impl TournamentParser for FederationParser {
    fn kind(&self) -> SourceKind {
        SourceKind::Federation
    }

    fn parse(&self, payload: &RawPayload) -> Result<ParseOutput, ParseError> {
        let text = body_text(payload)?;
        parse_html(SourceKind::Federation, &FEDERATION_LAYOUT, payload, &text)
    }
}

pub fn parser_for_kind(kind: SourceKind) -> Box<dyn TournamentParser> {
    match kind {
        SourceKind::Fide => Box::new(FideParser),
        SourceKind::Federation => Box::new(FederationParser),
    }
}
