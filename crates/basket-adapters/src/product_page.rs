//! Title and price extraction from a product detail page.

use std::str::FromStr;

use basket_core::{PriceQuote, UNKNOWN_PRODUCT};
use rust_decimal::Decimal;
use scraper::{Html, Selector};
use tracing::warn;

use crate::SourceError;

const BLOCK_PAGE_MARKERS: [&str; 2] = ["CAPTCHA", "Robot Check"];

const DEFAULT_CURRENCY: &str = "$";

/// Price regions tied to the product itself. When the item is unavailable only
/// these are trusted; the general `.a-price` selector would otherwise pick up
/// prices of similar products further down the page.
const CORE_PRICE_SELECTORS: [&str; 4] = [
    "#corePrice_feature_div .a-price .a-offscreen",
    "#corePriceDisplay_desktop_feature_div .a-price .a-offscreen",
    "#priceblock_ourprice",
    "#priceblock_dealprice",
];

const PRICE_SELECTORS: [&str; 3] = [
    ".a-price .a-offscreen",
    "#priceblock_ourprice",
    "#priceblock_dealprice",
];

pub fn is_block_page_title(title: &str) -> bool {
    BLOCK_PAGE_MARKERS.iter().any(|marker| title.contains(marker))
}

/// Parses `$1,234.56`-style text. Everything but digits and dots is dropped.
pub fn parse_price_text(text: &str) -> Option<Decimal> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned).ok()
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn select_first_text(document: &Html, css: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(document: &Html, css: &str, attr: &str) -> Result<Option<String>, SourceError> {
    let sel = selector(css)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn extract_title(document: &Html, page_title: &str) -> Result<String, SourceError> {
    let title = select_first_text(document, "#productTitle")?
        .or(select_first_attr(document, r#"meta[name="title"]"#, "content")?)
        .or(select_first_attr(document, r#"meta[property="og:title"]"#, "content")?)
        .or(select_first_text(document, "h1")?)
        .or_else(|| {
            text_or_none(
                page_title
                    .replace("Amazon.com: ", "")
                    .replace(" : Amazon.com", ""),
            )
        });

    Ok(title.unwrap_or_else(|| {
        warn!(page_title, "could not extract product title");
        UNKNOWN_PRODUCT.to_string()
    }))
}

fn is_unavailable(document: &Html) -> Result<bool, SourceError> {
    Ok(select_first_text(document, "#availability")?
        .map(|text| text.to_ascii_lowercase().contains("currently unavailable"))
        .unwrap_or(false))
}

fn extract_price_text(document: &Html) -> Result<Option<String>, SourceError> {
    if is_unavailable(document)? {
        for css in CORE_PRICE_SELECTORS {
            if let Some(text) = select_first_text(document, css)? {
                return Ok(Some(text));
            }
        }
        return Ok(None);
    }

    for css in PRICE_SELECTORS {
        if let Some(text) = select_first_text(document, css)? {
            return Ok(Some(text));
        }
    }

    let whole = select_first_text(document, ".a-price-whole")?;
    let fraction = select_first_text(document, ".a-price-fraction")?;
    Ok(match (whole, fraction) {
        (Some(whole), Some(fraction)) => {
            Some(format!("{}.{}", whole.trim_end_matches('.'), fraction))
        }
        (Some(whole), None) => Some(whole),
        _ => None,
    })
}

/// Extracts `(price, title, currency)` from a product page.
///
/// Block pages short-circuit to an empty quote. Otherwise the title always
/// resolves (falling back to "Unknown Product") and the currency is `$`; the
/// price may still be missing.
pub fn parse_product_page(html: &str) -> Result<PriceQuote, SourceError> {
    let document = Html::parse_document(html);
    let page_title = select_first_text(&document, "title")?.unwrap_or_default();

    if is_block_page_title(&page_title) {
        warn!(page_title, "block page detected");
        return Ok(PriceQuote::empty());
    }

    let title = extract_title(&document, &page_title)?;
    let price = match extract_price_text(&document)? {
        Some(text) => {
            let parsed = parse_price_text(&text);
            if parsed.is_none() {
                warn!(%text, "could not parse price text");
            }
            parsed
        }
        None => None,
    };

    Ok(PriceQuote {
        price,
        title: Some(title),
        currency: Some(DEFAULT_CURRENCY.to_string()),
    })
}
