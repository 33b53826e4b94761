use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Sentinel for a field the panel did not expose.
pub const NOT_AVAILABLE: &str = "N/A";

/// Separator used when a field has more than one distinct match.
pub const MULTI_VALUE_SEPARATOR: &str = "; ";

// ============================================================================
// Data Structures
// ============================================================================

/// One business lead as written to the sink and streamed to observers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LeadRecord {
    pub name: String,
    pub phone: String,
    pub website: String,
    pub address: String,
    pub source_url: Option<String>,
}

impl LeadRecord {
    /// Record with every optional field set to `N/A`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phone: NOT_AVAILABLE.to_string(),
            website: NOT_AVAILABLE.to_string(),
            address: NOT_AVAILABLE.to_string(),
            source_url: None,
        }
    }
}

/// Raw content of a result's expanded detail panel.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PanelSnapshot {
    /// Rendered `innerText` of the panel
    pub text: String,
    /// Panel markup, used for labeled elements when present
    #[serde(default)]
    pub html: String,
    /// Page URL while the panel was open
    #[serde(default)]
    pub url: Option<String>,
}

impl PanelSnapshot {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.html.trim().is_empty()
    }
}

// ============================================================================
// Patterns
// ============================================================================

static PHONE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\+?\(?\d[\d \t().\-]{6,}\d").expect("phone pattern"));

/// Star rating with review count, as shown next to listings: "4.5 (120)", "4,8(1.2K)".
static RATING_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d[.,]\d\s*\(\s*\d[\d,.]*\s*[kK]?\s*\)").expect("rating pattern"));

static URL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[A-Za-z][A-Za-z0-9+.\-]*://[^\s"'<>]+"#).expect("url pattern"));

static NAME_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").expect("name selector"));
static PHONE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-item-id^='phone']").expect("phone selector"));
static WEBSITE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[data-item-id='authority']").expect("website selector"));
static ADDRESS_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[data-item-id='address']").expect("address selector"));

const MIN_PHONE_DIGITS: usize = 8;
const MAX_PHONE_DIGITS: usize = 15;

// ============================================================================
// Extraction
// ============================================================================

/// Turn a panel snapshot into a lead.
///
/// Returns `None` only when no name can be found; every other field degrades
/// to [`NOT_AVAILABLE`].
pub fn extract(panel: &PanelSnapshot) -> Option<LeadRecord> {
    let labeled = LabeledFields::parse(&panel.html);

    let name = labeled
        .name
        .clone()
        .or_else(|| first_line(&panel.text))?;

    let mut phone_sources = labeled.phones.clone();
    phone_sources.push(panel.text.clone());
    let phones = extract_phone_numbers(&phone_sources.join("\n"));

    let mut websites = labeled.websites.clone();
    websites.extend(extract_urls(&panel.text));
    let websites = distinct_by(websites, |w| w.trim_end_matches('/').to_lowercase());

    Some(LeadRecord {
        name,
        phone: join_or_na(&phones),
        website: join_or_na(&websites),
        address: labeled.address.unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        source_url: panel.url.clone().filter(|u| !u.trim().is_empty()),
    })
}

/// Distinct phone-like matches (8 to 15 digits), in order of appearance.
///
/// Ratings are masked out first. A match holding more digits than one number
/// can have is split at its spaces into consecutive numbers.
pub fn extract_phone_numbers(text: &str) -> Vec<String> {
    let masked = RATING_REGEX.replace_all(text, "\n");
    let candidates = PHONE_REGEX
        .find_iter(&masked)
        .flat_map(|m| phone_groups(m.as_str()))
        .collect::<Vec<_>>();

    distinct_by(candidates, |p| p.chars().filter(char::is_ascii_digit).collect())
}

/// Phone numbers inside one pattern match.
fn phone_groups(candidate: &str) -> Vec<String> {
    let tokens: Vec<&str> = candidate
        .split_whitespace()
        .skip_while(|t| is_decimal_token(t))
        .collect();

    let digits: usize = tokens.iter().map(|t| digit_count(t)).sum();
    if digits <= MAX_PHONE_DIGITS {
        return if digits >= MIN_PHONE_DIGITS {
            vec![tokens.join(" ")]
        } else {
            Vec::new()
        };
    }

    let mut numbers = Vec::new();
    let mut group: Vec<&str> = Vec::new();
    let mut group_digits = 0;
    for token in tokens {
        let n = digit_count(token);
        if !group.is_empty() && group_digits + n > MAX_PHONE_DIGITS {
            if group_digits >= MIN_PHONE_DIGITS {
                numbers.push(group.join(" "));
            }
            group.clear();
            group_digits = 0;
        }
        group.push(token);
        group_digits += n;
    }
    if (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&group_digits) {
        numbers.push(group.join(" "));
    }
    numbers
}

/// "4.5" style tokens: a rating, never the start of a number.
fn is_decimal_token(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 3 && bytes[0].is_ascii_digit() && matches!(bytes[1], b'.' | b',') && bytes[2].is_ascii_digit()
}

/// Distinct `scheme://...` matches, in order of appearance.
pub fn extract_urls(text: &str) -> Vec<String> {
    let candidates = URL_REGEX
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | ')' | ']' | '!' | '?'))
                .to_string()
        })
        .map(|u| decode_search_url(&u));

    distinct_by(candidates, |u| u.to_lowercase())
}

/// Unwrap search-engine redirect links (`/url?q=https://...`) to their target.
pub fn decode_search_url(url: &str) -> String {
    let is_redirect = url.starts_with("/url?") || (url.contains("google.") && url.contains("/url?"));
    if is_redirect {
        if let Some((_, query)) = url.split_once('?') {
            for pair in query.split('&') {
                if let Some(value) = pair.strip_prefix("q=").or_else(|| pair.strip_prefix("url=")) {
                    if let Ok(decoded) = urlencoding::decode(value) {
                        return decoded.into_owned();
                    }
                }
            }
        }
    }
    url.to_string()
}

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Default)]
struct LabeledFields {
    name: Option<String>,
    phones: Vec<String>,
    websites: Vec<String>,
    address: Option<String>,
}

impl LabeledFields {
    fn parse(html: &str) -> Self {
        if html.trim().is_empty() {
            return Self::default();
        }
        let document = Html::parse_fragment(html);

        let name = document
            .select(&NAME_SELECTOR)
            .filter_map(|el| non_empty(element_text(&el)))
            .next();

        let phones = document
            .select(&PHONE_SELECTOR)
            .filter_map(|el| non_empty(element_text(&el)).or_else(|| labeled_attr(&el)))
            .collect();

        let websites = document
            .select(&WEBSITE_SELECTOR)
            .filter_map(|el| el.value().attr("href"))
            .map(decode_search_url)
            .filter(|href| href.contains("://"))
            .collect();

        let address = document
            .select(&ADDRESS_SELECTOR)
            .filter_map(|el| non_empty(element_text(&el)).or_else(|| labeled_attr(&el)))
            .next();

        Self {
            name,
            phones,
            websites,
            address,
        }
    }
}

fn element_text(el: &ElementRef) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

/// `aria-label="Address: 1 Front St"` style fallback.
fn labeled_attr(el: &ElementRef) -> Option<String> {
    let label = el.value().attr("aria-label")?;
    let value = label.split_once(": ").map(|(_, v)| v).unwrap_or(label);
    non_empty(clean_text(value))
}

/// Drop icon-font glyphs (private use area) and collapse whitespace.
fn clean_text(raw: &str) -> String {
    let stripped: String = raw
        .chars()
        .filter(|c| !('\u{E000}'..='\u{F8FF}').contains(c))
        .collect();
    collapse_whitespace(&stripped)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_line(text: &str) -> Option<String> {
    text.lines().map(clean_text).find(|l| !l.is_empty())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

fn digit_count(s: &str) -> usize {
    s.chars().filter(char::is_ascii_digit).count()
}

fn distinct_by<I, F>(items: I, key: F) -> Vec<String>
where
    I: IntoIterator<Item = String>,
    F: Fn(&str) -> String,
{
    let mut seen = HashSet::new();
    items.into_iter().filter(|item| seen.insert(key(item))).collect()
}

fn join_or_na(values: &[String]) -> String {
    if values.is_empty() {
        NOT_AVAILABLE.to_string()
    } else {
        values.join(MULTI_VALUE_SEPARATOR)
    }
}
