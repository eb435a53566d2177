//! Label/value field extraction shared by the HTML boards.

use std::sync::LazyLock;

use chrono::{FixedOffset, NaiveDate, TimeZone};
use jc_core::TextNormalizer;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

static LABEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("div.label").expect("static label selector"));

static DEPARTMENT_LOCATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^([0-9]+) - (.*)$").expect("static location regex"));

/// Plain-text rendering through `scraper`'s HTML5 parser.
#[derive(Debug, Default, Clone, Copy)]
pub struct HtmlTextNormalizer;

impl TextNormalizer for HtmlTextNormalizer {
    fn to_text(&self, html: &str) -> String {
        let fragment = Html::parse_fragment(html);
        collapse_whitespace(&fragment.root_element().text().collect::<String>())
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

pub fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(collapse_whitespace(&element.text().collect::<String>()))
}

/// One `<div class="label">` / `<div class="value">` pair, with its raw
/// fallback pattern compiled once.
#[derive(Debug, Clone)]
pub struct LabeledField {
    label: String,
    fallback: Regex,
}

impl LabeledField {
    pub fn new(label: &str) -> Result<Self, regex::Error> {
        let fallback = Regex::new(&format!(
            r#"(?s)<div class="label"><span>{}</span></div>(.*?)<div class="value"><span[^>]*>(.*?)</span></div>"#,
            regex::escape(label)
        ))?;
        Ok(Self {
            label: label.to_string(),
            fallback,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Value shown next to the label inside `scope`, or `None` when the pair
    /// is missing or empty.
    ///
    /// Looks for `<div class="label">` whose text is the label and reads the
    /// following sibling `<div class="value">`, stopping at the next label.
    /// When the markup does not nest that way the serialized scope is matched
    /// against the raw label/value pattern instead. Neither lookup reads a
    /// value past another label.
    pub fn extract(&self, scope: ElementRef<'_>, normalizer: &dyn TextNormalizer) -> Option<String> {
        self.structural_value(scope)
            .or_else(|| self.pattern_value(scope, normalizer))
    }

    fn structural_value(&self, scope: ElementRef<'_>) -> Option<String> {
        scope
            .select(&LABEL)
            .filter(|candidate| element_text(*candidate).as_deref() == Some(self.label.as_str()))
            .find_map(|label_div| {
                label_div
                    .next_siblings()
                    .filter_map(ElementRef::wrap)
                    .take_while(|sibling| !has_class(*sibling, "label"))
                    .find(|sibling| has_class(*sibling, "value"))
                    .and_then(element_text)
            })
    }

    fn pattern_value(&self, scope: ElementRef<'_>, normalizer: &dyn TextNormalizer) -> Option<String> {
        let html = scope.html();
        let caps = self.fallback.captures(&html)?;
        if caps.get(1)?.as_str().contains(r#"class="label""#) {
            return None;
        }
        let captured = caps.get(2)?.as_str();
        text_or_none(normalizer.to_text(captured))
    }
}

fn has_class(element: ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Splits `"75 - Paris"` into `(Some("75"), Some("Paris"))`. Text without a
/// leading department code is kept whole as the location.
pub fn split_location(text: &str) -> (Option<String>, Option<String>) {
    let text = collapse_whitespace(text);
    match DEPARTMENT_LOCATION.captures(&text) {
        Some(caps) => (
            caps.get(1).and_then(|m| text_or_none(m.as_str().to_string())),
            caps.get(2).and_then(|m| text_or_none(m.as_str().to_string())),
        ),
        None => (None, text_or_none(text)),
    }
}

/// Parses a `dd/mm/yyyy` date as midnight in `timezone`, returned as epoch seconds.
pub fn parse_day_month_year(text: &str, timezone: FixedOffset) -> Option<i64> {
    let date = NaiveDate::parse_from_str(text.trim(), "%d/%m/%Y").ok()?;
    let midnight = date.and_hms_opt(0, 0, 0)?;
    timezone
        .from_local_datetime(&midnight)
        .single()
        .map(|dt| dt.timestamp())
}
