//! Fallback-chain field extraction.
//!
//! The portal's class names churn, so every logical field resolves through
//! an ordered list of locator strategies; the first locator whose raw text
//! passes the field's plausibility filter and parses into the field's type
//! short-circuits the chain. Failure of one field never aborts the others,
//! so unstable markup degrades to partial records instead of lost listings.

pub mod locator;
pub mod text;

use std::collections::HashMap;

use chrono::{Datelike, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use crate::models::ListingRecord;
use locator::{element_text, Locator};
use text::CountKind;

pub const PORTAL_BASE_URL: &str = "https://www.portalinmobiliario.com";

lazy_static! {
    static ref LISTING_ID: Regex = Regex::new(r"MLC-?(\d+)").unwrap();
}

/// Logical listing fields, each backed by its own locator chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    DetailUrl,
    Title,
    Price,
    MaintenanceFee,
    Bedrooms,
    Bathrooms,
    TotalArea,
    BuiltArea,
    ParkingSpots,
    Address,
    Latitude,
    Longitude,
    BuildingAge,
    FloorNumber,
    TotalFloors,
    Amenities,
}

/// Resolves logical fields against rendered page content through per-field
/// fallback chains configured at construction time.
pub struct FieldExtractor {
    chains: HashMap<Field, Vec<Locator>>,
    card_locators: Vec<Option<Selector>>,
    next_page_locators: Vec<Option<Selector>>,
}

impl FieldExtractor {
    /// An extractor with no chains. Used by tests to build small tables.
    pub fn empty() -> Self {
        Self {
            chains: HashMap::new(),
            card_locators: Vec::new(),
            next_page_locators: Vec::new(),
        }
    }

    /// Replace the locator chain for one field.
    pub fn set_chain(&mut self, field: Field, locators: Vec<Locator>) {
        self.chains.insert(field, locators);
    }

    /// The full locator table for Portal Inmobiliario search result pages.
    pub fn portal_default() -> Self {
        let mut ex = Self::empty();

        ex.card_locators = compile(&[
            "li.ui-search-layout__item",
            "div.ui-search-result__wrapper",
            "div.ui-search-result",
            "article",
            "a[href*='MLC']",
        ]);
        ex.next_page_locators = compile(&[
            "a.andes-pagination__link[title='Siguiente']",
            "li.andes-pagination__button--next a",
            "a[rel='next']",
        ]);

        ex.set_chain(
            Field::DetailUrl,
            vec![
                Locator::attr("a.ui-search-link", "href"),
                Locator::attr("a[href*='MLC']", "href"),
                Locator::attr("a", "href"),
            ],
        );
        ex.set_chain(
            Field::Title,
            vec![
                Locator::css("h2.ui-search-item__title"),
                Locator::css("a.ui-search-link h2"),
                Locator::css("h2"),
                Locator::attr("a[href*='MLC']", "title"),
            ],
        );
        ex.set_chain(
            Field::Price,
            vec![
                Locator::css("span.andes-money-amount"),
                Locator::css("div.ui-search-price__second-line"),
                Locator::css("[class*='price']"),
                Locator::contains("span", "uf"),
                Locator::contains("span", "$"),
            ],
        );
        ex.set_chain(
            Field::MaintenanceFee,
            vec![
                Locator::contains("li", "gastos comunes"),
                Locator::contains("span", "gastos comunes"),
            ],
        );
        ex.set_chain(
            Field::Bedrooms,
            vec![
                Locator::contains("li", "dormitorio"),
                Locator::contains("span", "dormitorio"),
                Locator::contains("li", "dorm"),
                Locator::OwnText,
            ],
        );
        ex.set_chain(
            Field::Bathrooms,
            vec![
                Locator::contains("li", "baño"),
                Locator::contains("span", "baño"),
                Locator::OwnText,
            ],
        );
        ex.set_chain(
            Field::TotalArea,
            vec![
                Locator::contains("li", "total"),
                Locator::contains("li", "m²"),
                Locator::contains("span", "m²"),
                Locator::OwnText,
            ],
        );
        ex.set_chain(
            Field::BuiltArea,
            vec![
                Locator::contains("li", "útil"),
                Locator::contains("li", "construido"),
                Locator::contains("span", "útil"),
            ],
        );
        ex.set_chain(
            Field::ParkingSpots,
            vec![
                Locator::contains("li", "estacionamiento"),
                Locator::contains("span", "estacionamiento"),
            ],
        );
        ex.set_chain(
            Field::Address,
            vec![
                Locator::css(".ui-search-item__location"),
                Locator::css("[class*='location']"),
                Locator::css("[class*='address']"),
            ],
        );
        ex.set_chain(
            Field::Latitude,
            vec![
                Locator::attr("[data-lat]", "data-lat"),
                Locator::attr("[data-latitude]", "data-latitude"),
            ],
        );
        ex.set_chain(
            Field::Longitude,
            vec![
                Locator::attr("[data-lng]", "data-lng"),
                Locator::attr("[data-longitude]", "data-longitude"),
                Locator::attr("[data-lon]", "data-lon"),
            ],
        );
        ex.set_chain(
            Field::BuildingAge,
            vec![
                Locator::contains("li", "año"),
                Locator::contains("tr", "año"),
            ],
        );
        ex.set_chain(
            Field::FloorNumber,
            vec![
                Locator::contains("li", "piso"),
                Locator::contains("span", "piso"),
            ],
        );
        ex.set_chain(
            Field::TotalFloors,
            vec![Locator::contains("li", "pisos"), Locator::OwnText],
        );
        ex.set_chain(
            Field::Amenities,
            vec![
                Locator::css("ul[class*='amenities']"),
                Locator::css("div[class*='amenities']"),
                Locator::OwnText,
            ],
        );

        ex
    }

    /// Resolve a field to its raw (plausible) string without parsing.
    pub fn resolve(&self, field: Field, scope: ElementRef<'_>) -> Option<String> {
        self.resolve_with(field, scope, |raw| Some(raw.to_string()))
    }

    /// Walk the field's chain in order. A locator succeeds only when its raw
    /// text passes the plausibility filter AND `parse` accepts it; any other
    /// outcome silently continues to the next candidate.
    pub fn resolve_with<T>(
        &self,
        field: Field,
        scope: ElementRef<'_>,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        for loc in self.chains.get(&field)? {
            let Some(raw) = loc.try_match(scope) else {
                continue;
            };
            if !plausible(field, &raw) {
                continue;
            }
            if let Some(value) = parse(&raw) {
                return Some(value);
            }
        }
        None
    }

    /// Enumerate candidate listing cards in document order. The card chain
    /// follows the same fallback discipline as field chains: the first
    /// selector yielding a non-empty set wins.
    pub fn listing_elements<'a>(&self, doc: &'a Html) -> Vec<ElementRef<'a>> {
        for selector in self.card_locators.iter().flatten() {
            let cards: Vec<ElementRef<'a>> = doc.select(selector).collect();
            if !cards.is_empty() {
                return cards;
            }
        }
        Vec::new()
    }

    /// Whether the page offers a next-page affordance.
    pub fn has_next_page(&self, doc: &Html) -> bool {
        for selector in self.next_page_locators.iter().flatten() {
            if let Some(el) = doc.select(selector).next() {
                let disabled = el.value().attr("aria-disabled") == Some("true")
                    || el
                        .value()
                        .attr("class")
                        .is_some_and(|c| c.contains("disabled"));
                return !disabled;
            }
        }
        false
    }

    /// Run every field chain against one listing card and assemble the
    /// record. Returns `None` only when no stable identifier can be derived;
    /// every other miss leaves its field `None` and moves on.
    pub fn extract_listing(
        &self,
        card: ElementRef<'_>,
        extract_coordinates: bool,
    ) -> Option<ListingRecord> {
        let href = self.resolve(Field::DetailUrl, card);
        let listing_id = href.as_deref().and_then(listing_id_from_url)?;

        let mut record = ListingRecord::new(listing_id);
        record.url = href.map(|h| absolutize(&clean_url(&h)));
        record.title = self.resolve(Field::Title, card);

        if let Some((raw, currency, amount)) = self.resolve_with(Field::Price, card, |raw| {
            text::parse_price(raw).map(|(c, a)| (raw.to_string(), c, a))
        }) {
            record.price_raw = Some(raw);
            record.set_price(currency, amount);
        }
        record.maintenance_fee = self.resolve(Field::MaintenanceFee, card);

        record.bedrooms =
            self.resolve_with(Field::Bedrooms, card, |raw| {
                text::parse_count(raw, CountKind::Bedrooms)
            });
        record.bathrooms =
            self.resolve_with(Field::Bathrooms, card, |raw| {
                text::parse_count(raw, CountKind::Bathrooms)
            });
        record.parking_spots = self.resolve_with(Field::ParkingSpots, card, |raw| {
            text::parse_count(raw, CountKind::ParkingSpots)
        });
        record.total_area_m2 = self.resolve_with(Field::TotalArea, card, parse_sane_area);
        record.built_area_m2 = self.resolve_with(Field::BuiltArea, card, parse_sane_area);

        if let Some(address) = self.resolve(Field::Address, card) {
            // "Av. Apoquindo 123, Las Condes, Santiago": first segment is
            // the street, the second the neighborhood/comuna
            let mut parts = address.split(',').map(str::trim);
            record.neighborhood = parts.next().map(str::to_string);
            record.comuna = parts.next().map(str::to_string);
            record.address = Some(address);
        }

        if extract_coordinates {
            record.latitude = self.resolve_with(Field::Latitude, card, text::parse_coordinate);
            record.longitude = self.resolve_with(Field::Longitude, card, text::parse_coordinate);
        }

        let current_year = Utc::now().year();
        record.building_age = self.resolve_with(Field::BuildingAge, card, |raw| {
            text::parse_year_to_age(raw, current_year)
        });
        record.floor_number = self.resolve_with(Field::FloorNumber, card, text::parse_floor);
        record.total_floors = self.resolve_with(Field::TotalFloors, card, text::parse_total_floors);

        let card_text = text::normalize_amenity(&element_text(card));
        if card_text.contains("sin ascensor") {
            record.has_elevator = Some(false);
        } else if card_text.contains("ascensor") {
            record.has_elevator = Some(true);
        }

        if let Some(blob) = self.resolve(Field::Amenities, card) {
            record.amenities = text::canonical_amenities(&blob);
        }
        if record.amenities.iter().any(|a| a == "pool") {
            record.has_pool = Some(true);
        }
        if record.amenities.iter().any(|a| a == "gym") {
            record.has_gym = Some(true);
        }
        if record
            .amenities
            .iter()
            .any(|a| a == "security" || a == "doorman")
        {
            record.has_security = Some(true);
        }

        debug!(
            listing_id = %record.listing_id,
            has_price = record.has_price(),
            bedrooms = ?record.bedrooms,
            "extracted listing"
        );
        Some(record)
    }
}

fn compile(selectors: &[&str]) -> Vec<Option<Selector>> {
    selectors.iter().map(|s| Selector::parse(s).ok()).collect()
}

/// Field-specific plausibility filters applied to raw locator output before
/// parsing. A raw value that fails here is a non-match.
fn plausible(field: Field, raw: &str) -> bool {
    let has_digit = raw.chars().any(|c| c.is_ascii_digit());
    match field {
        Field::Price => has_digit && (raw.to_uppercase().contains("UF") || raw.contains('$')),
        Field::MaintenanceFee => has_digit && raw.to_lowercase().contains("gasto"),
        Field::TotalArea | Field::BuiltArea => has_digit && raw.to_lowercase().contains('m'),
        Field::Bedrooms
        | Field::Bathrooms
        | Field::ParkingSpots
        | Field::BuildingAge
        | Field::FloorNumber
        | Field::TotalFloors
        | Field::Latitude
        | Field::Longitude => has_digit,
        Field::Title => raw.len() >= 8,
        Field::Address => raw.len() > 5,
        Field::DetailUrl => raw.contains('/'),
        Field::Amenities => !raw.is_empty(),
    }
}

/// Areas must land in a sane range for an apartment before they count.
fn parse_sane_area(raw: &str) -> Option<f64> {
    text::parse_area(raw).filter(|a| (10.0..=2000.0).contains(a))
}

/// Derive the stable listing identifier from a detail URL. Falls back to the
/// trailing path segment when no `MLC` token is present.
pub fn listing_id_from_url(url: &str) -> Option<String> {
    if let Some(caps) = LISTING_ID.captures(url) {
        return Some(format!("MLC-{}", &caps[1]));
    }
    clean_url(url)
        .rsplit('/')
        .find(|seg| !seg.is_empty())
        .filter(|seg| !seg.contains('.'))
        .map(str::to_string)
}

fn clean_url(url: &str) -> String {
    url.split(['#', '?']).next().unwrap_or(url).to_string()
}

fn absolutize(url: &str) -> String {
    if url.starts_with('/') {
        format!("{PORTAL_BASE_URL}{url}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Currency;

    const CARD: &str = r#"
      <li class="ui-search-layout__item">
        <a class="ui-search-link" href="/departamento/MLC-1472583690-depto#tracking">
          <h2 class="ui-search-item__title">Departamento en Las Condes con vista</h2>
        </a>
        <span class="andes-money-amount">UF 5.300</span>
        <ul>
          <li>3 dormitorios</li>
          <li>2 baños</li>
          <li>82,5 m² totales</li>
          <li>Gastos comunes $ 120.000</li>
        </ul>
        <div class="ui-search-item__location">San Carlos de Apoquindo, Las Condes</div>
        <div class="amenities">Piscina, gimnasio, ascensor y quincho</div>
      </li>"#;

    fn card_doc() -> Html {
        Html::parse_fragment(CARD)
    }

    #[test]
    fn fallback_ordering_first_success_wins() {
        let doc = Html::parse_fragment(
            r#"<div><p class="b">UF 4.200</p><p class="c">UF 9.999</p></div>"#,
        );
        let mut ex = FieldExtractor::empty();
        ex.set_chain(
            Field::Price,
            vec![
                Locator::css("p.a"), // never matches
                Locator::css("p.b"), // matches
                Locator::css("p.c"), // must never be consulted
            ],
        );
        let got = ex.resolve_with(Field::Price, doc.root_element(), text::parse_price);
        assert_eq!(got, Some((Currency::Uf, 4200.0)));
    }

    #[test]
    fn implausible_match_continues_the_chain() {
        // First locator matches but has no currency marker; chain must fall
        // through to the second
        let doc = Html::parse_fragment(
            r#"<div><p class="a">5300</p><p class="b">UF 5.300</p></div>"#,
        );
        let mut ex = FieldExtractor::empty();
        ex.set_chain(
            Field::Price,
            vec![Locator::css("p.a"), Locator::css("p.b")],
        );
        let got = ex.resolve_with(Field::Price, doc.root_element(), text::parse_price);
        assert_eq!(got, Some((Currency::Uf, 5300.0)));
    }

    #[test]
    fn parse_failure_continues_the_chain() {
        // First locator matches and is plausible, but the parsed value falls
        // outside the sane range; the chain must move on, not error
        let doc = Html::parse_fragment(
            r#"<div><p class="a">99.999 m²</p><p class="b">82 m²</p></div>"#,
        );
        let mut ex = FieldExtractor::empty();
        ex.set_chain(
            Field::TotalArea,
            vec![Locator::css("p.a"), Locator::css("p.b")],
        );
        let got = ex.resolve_with(Field::TotalArea, doc.root_element(), parse_sane_area);
        assert_eq!(got, Some(82.0));
    }

    #[test]
    fn full_card_extraction() {
        let doc = card_doc();
        let ex = FieldExtractor::portal_default();
        let cards = ex.listing_elements(&doc);
        assert_eq!(cards.len(), 1);

        let record = ex.extract_listing(cards[0], true).unwrap();
        assert_eq!(record.listing_id, "MLC-1472583690");
        assert_eq!(
            record.url.as_deref(),
            Some("https://www.portalinmobiliario.com/departamento/MLC-1472583690-depto")
        );
        assert_eq!(
            record.title.as_deref(),
            Some("Departamento en Las Condes con vista")
        );
        assert_eq!(record.currency, Some(Currency::Uf));
        assert_eq!(record.price_uf, Some(5300.0));
        assert_eq!(record.price_clp, None);
        assert_eq!(record.bedrooms, Some(3));
        assert_eq!(record.bathrooms, Some(2));
        assert_eq!(record.total_area_m2, Some(82.5));
        assert_eq!(record.neighborhood.as_deref(), Some("San Carlos de Apoquindo"));
        assert_eq!(record.comuna.as_deref(), Some("Las Condes"));
        assert!(record.maintenance_fee.is_some());
        assert_eq!(record.amenities, vec!["bbq area", "elevator", "gym", "pool"]);
        assert_eq!(record.has_pool, Some(true));
        assert_eq!(record.has_gym, Some(true));
        assert_eq!(record.has_elevator, Some(true));
        assert_eq!(record.has_security, None);
    }

    #[test]
    fn graceful_partiality_missing_fields_stay_none() {
        // A card with a title and price but nothing else
        let doc = Html::parse_fragment(
            r#"<li class="ui-search-layout__item">
                 <a href="/MLC-42">
                   <h2>Departamento céntrico luminoso</h2>
                 </a>
                 <span class="andes-money-amount">$ 185.000.000</span>
               </li>"#,
        );
        let ex = FieldExtractor::portal_default();
        let cards = ex.listing_elements(&doc);
        let record = ex.extract_listing(cards[0], true).unwrap();

        assert_eq!(record.listing_id, "MLC-42");
        assert_eq!(record.bedrooms, None);
        assert_eq!(record.total_area_m2, None);
        assert_eq!(record.latitude, None);
        // ...while unrelated fields still extracted
        assert_eq!(record.price_clp, Some(185_000_000.0));
        assert_eq!(record.currency, Some(Currency::Clp));
        assert!(record.title.is_some());
    }

    #[test]
    fn card_without_identifier_is_rejected() {
        let doc = Html::parse_fragment(
            r#"<li class="ui-search-layout__item"><h2>Sin enlace de detalle</h2></li>"#,
        );
        let ex = FieldExtractor::portal_default();
        let cards = ex.listing_elements(&doc);
        assert!(ex.extract_listing(cards[0], false).is_none());
    }

    #[test]
    fn listing_ids_from_urls() {
        assert_eq!(
            listing_id_from_url("https://x.cl/d/MLC-123456-depto"),
            Some("MLC-123456".to_string())
        );
        assert_eq!(
            listing_id_from_url("/departamento/MLC987"),
            Some("MLC-987".to_string())
        );
        assert_eq!(
            listing_id_from_url("/venta/la-reina/casa-42"),
            Some("casa-42".to_string())
        );
    }

    #[test]
    fn next_page_affordance() {
        let ex = FieldExtractor::portal_default();

        let with_next = Html::parse_document(
            r#"<ul><li class="andes-pagination__button--next"><a href="/p2">Siguiente</a></li></ul>"#,
        );
        assert!(ex.has_next_page(&with_next));

        let disabled = Html::parse_document(
            r##"<ul><li class="andes-pagination__button--next">
                 <a aria-disabled="true" href="#">Siguiente</a></li></ul>"##,
        );
        assert!(!ex.has_next_page(&disabled));

        let last_page = Html::parse_document("<div>no pagination</div>");
        assert!(!ex.has_next_page(&last_page));
    }
}
