//! Text-to-value parsing for the extraction chains.
//!
//! One pure function per semantic unit, so parsing is testable without any
//! page structure. Raw portal text is Chilean-Spanish with locale separators
//! (`.` for thousands, `,` for decimals) and mixed-language labels.

use lazy_static::lazy_static;
use regex::Regex;

use crate::models::Currency;

lazy_static! {
    static ref NUMBER: Regex = Regex::new(r"[\d][\d.,]*").unwrap();
    static ref THOUSANDS_GROUPED: Regex = Regex::new(r"^\d{1,3}(\.\d{3})+$").unwrap();
    static ref UF_MARKER: Regex = Regex::new(r"(?i)\bUF\b").unwrap();
    static ref BEDROOMS: Regex =
        Regex::new(r"(\d+)\s*(?:dormitorio|dorm\b|bedroom|habitaci[oó]n)").unwrap();
    static ref BATHROOMS: Regex = Regex::new(r"(\d+)\s*(?:ba[ñn]o|bathroom|bath\b)").unwrap();
    static ref PARKING: Regex =
        Regex::new(r"(\d+)\s*(?:estacionamiento|parking|garage|cochera)").unwrap();
    static ref AREA: Regex = Regex::new(r"([\d][\d.,]*)\s*(?:m²|m2\b|mts2?\b|metros)").unwrap();
    static ref YEAR: Regex = Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap();
    static ref FLOOR: Regex =
        Regex::new(r"(?:piso|floor)\s*(\d+)|(\d+)\s*(?:º|°)?\s*piso\b").unwrap();
    static ref TOTAL_FLOORS: Regex = Regex::new(r"(\d+)\s*pisos\b").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Parse a number written with Chilean separators into an f64.
///
/// `5.300` is five thousand three hundred, `5,5` is five and a half, and
/// `1.234,56` carries both separators with the comma as the decimal point.
pub fn decimal_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let has_dot = cleaned.contains('.');
    let has_comma = cleaned.contains(',');

    let normalized = if has_dot && has_comma {
        // The later separator is the decimal point
        if cleaned.rfind('.') > cleaned.rfind(',') {
            cleaned.replace(',', "")
        } else {
            cleaned.replace('.', "").replace(',', ".")
        }
    } else if has_comma {
        cleaned.replace(',', ".")
    } else if has_dot && THOUSANDS_GROUPED.is_match(&cleaned) {
        cleaned.replace('.', "")
    } else {
        cleaned
    };

    normalized.parse::<f64>().ok()
}

/// Parse a raw price token into a currency tag and amount.
///
/// Requires at least one digit and a currency marker; a bare number is not a
/// plausible price and yields `None`. `UF` wins over `$` when both appear,
/// since portal prices quote UF with the peso equivalent alongside.
pub fn parse_price(raw: &str) -> Option<(Currency, f64)> {
    if !raw.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let currency = if UF_MARKER.is_match(raw) {
        Currency::Uf
    } else if raw.contains('$') || raw.to_uppercase().contains("CLP") {
        Currency::Clp
    } else {
        return None;
    };

    let amount = NUMBER.find(raw).and_then(|m| decimal_number(m.as_str()))?;
    if amount <= 0.0 {
        return None;
    }
    Some((currency, amount))
}

/// Countable listing attributes with multilingual label variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    Bedrooms,
    Bathrooms,
    ParkingSpots,
}

/// Parse a count adjacent to one of the attribute's keyword variants,
/// e.g. "3 dormitorios", "2 baños", "1 estacionamiento".
pub fn parse_count(raw: &str, kind: CountKind) -> Option<u32> {
    let text = raw.to_lowercase();
    let pattern: &Regex = match kind {
        CountKind::Bedrooms => &BEDROOMS,
        CountKind::Bathrooms => &BATHROOMS,
        CountKind::ParkingSpots => &PARKING,
    };
    pattern
        .captures(&text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse a surface area in square meters from text like "82,5 m²" or
/// "120 m2 totales".
pub fn parse_area(raw: &str) -> Option<f64> {
    AREA.captures(&raw.to_lowercase())
        .and_then(|c| c.get(1))
        .and_then(|m| decimal_number(m.as_str()))
}

/// Parse a coordinate embedded in an attribute or map payload. Coordinates
/// always use a plain dot decimal, never locale separators.
pub fn parse_coordinate(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// Turn a construction year into a building age relative to `current_year`.
pub fn parse_year_to_age(raw: &str, current_year: i32) -> Option<u32> {
    let year: i32 = YEAR.captures(raw)?.get(1)?.as_str().parse().ok()?;
    if year > 1900 && year <= current_year {
        Some((current_year - year) as u32)
    } else {
        None
    }
}

/// Parse a floor number from "piso 7" or "7º piso".
pub fn parse_floor(raw: &str) -> Option<u32> {
    let text = raw.to_lowercase();
    let caps = FLOOR.captures(&text)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse a building's floor count from "20 pisos".
pub fn parse_total_floors(raw: &str) -> Option<u32> {
    TOTAL_FLOORS
        .captures(&raw.to_lowercase())
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Canonical amenity form: lowercase, accent-stripped, single-spaced.
pub fn normalize_amenity(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' | 'ü' => 'u',
            'ñ' => 'n',
            _ => c,
        })
        .collect();
    WHITESPACE.replace_all(&stripped, " ").into_owned()
}

/// Spanish amenity keywords mapped to canonical names.
const AMENITY_KEYWORDS: &[(&str, &str)] = &[
    ("piscina", "pool"),
    ("gimnasio", "gym"),
    ("seguridad", "security"),
    ("portero", "doorman"),
    ("conserje", "doorman"),
    ("jardin", "garden"),
    ("terraza", "terrace"),
    ("balcon", "balcony"),
    ("bodega", "storage"),
    ("quincho", "bbq area"),
    ("sala multiuso", "multipurpose room"),
    ("salon de eventos", "event room"),
    ("ascensor", "elevator"),
];

/// Scan a free-text blob for known amenity keywords and return the sorted,
/// de-duplicated canonical set.
pub fn canonical_amenities(raw: &str) -> Vec<String> {
    let haystack = normalize_amenity(raw);
    let mut found: Vec<String> = AMENITY_KEYWORDS
        .iter()
        .filter(|(keyword, _)| haystack.contains(keyword))
        .map(|(_, canonical)| canonical.to_string())
        .collect();
    found.sort();
    found.dedup();
    found
}
