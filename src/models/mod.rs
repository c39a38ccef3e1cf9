use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Currency of a parsed price. UF (unidad de fomento) and Chilean pesos are
/// mutually exclusive per raw price token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "UF")]
    Uf,
    #[serde(rename = "CLP")]
    Clp,
}

/// One scraped property listing.
///
/// Every field that can fail to resolve is an `Option`; `None` means the
/// fallback chain exhausted without a plausible match, which is distinct
/// from an extracted-but-empty value (those are never stored).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Stable external identifier, the upsert key
    pub listing_id: String,

    // Basic info
    pub title: Option<String>,
    pub url: Option<String>,

    // Financial
    pub price_raw: Option<String>,
    pub price_uf: Option<f64>,
    pub price_clp: Option<f64>,
    pub currency: Option<Currency>,
    pub maintenance_fee: Option<String>,

    // Property details
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub total_area_m2: Option<f64>,
    pub built_area_m2: Option<f64>,
    pub parking_spots: Option<u32>,

    // Location
    pub address: Option<String>,
    pub neighborhood: Option<String>,
    pub comuna: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,

    // Building
    pub building_age: Option<u32>,
    pub total_floors: Option<u32>,
    pub floor_number: Option<u32>,
    pub has_elevator: Option<bool>,

    // Amenities, normalized and de-duplicated
    pub amenities: Vec<String>,
    pub has_pool: Option<bool>,
    pub has_gym: Option<bool>,
    pub has_security: Option<bool>,

    // Metadata
    pub scraped_at: DateTime<Utc>,
    pub completeness_score: u8,
    pub issues: Vec<String>,
}

impl ListingRecord {
    /// An empty record for one listing, populated field-by-field by the
    /// extraction chains.
    pub fn new(listing_id: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            title: None,
            url: None,
            price_raw: None,
            price_uf: None,
            price_clp: None,
            currency: None,
            maintenance_fee: None,
            bedrooms: None,
            bathrooms: None,
            total_area_m2: None,
            built_area_m2: None,
            parking_spots: None,
            address: None,
            neighborhood: None,
            comuna: None,
            latitude: None,
            longitude: None,
            building_age: None,
            total_floors: None,
            floor_number: None,
            has_elevator: None,
            amenities: Vec::new(),
            has_pool: None,
            has_gym: None,
            has_security: None,
            scraped_at: Utc::now(),
            completeness_score: 0,
            issues: Vec::new(),
        }
    }

    /// Set the price from one parsed token. The currency tag decides which
    /// numeric column is populated; the other stays empty.
    pub fn set_price(&mut self, currency: Currency, amount: f64) {
        self.currency = Some(currency);
        match currency {
            Currency::Uf => self.price_uf = Some(amount),
            Currency::Clp => self.price_clp = Some(amount),
        }
    }

    pub fn has_price(&self) -> bool {
        self.currency.is_some() && (self.price_uf.is_some() || self.price_clp.is_some())
    }

    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_columns_are_mutually_exclusive() {
        let mut record = ListingRecord::new("MLC-1");
        record.set_price(Currency::Uf, 5300.0);
        assert_eq!(record.price_uf, Some(5300.0));
        assert_eq!(record.price_clp, None);
        assert_eq!(record.currency, Some(Currency::Uf));

        let mut record = ListingRecord::new("MLC-2");
        record.set_price(Currency::Clp, 185_000_000.0);
        assert_eq!(record.price_uf, None);
        assert_eq!(record.price_clp, Some(185_000_000.0));
    }

    #[test]
    fn new_record_is_empty() {
        let record = ListingRecord::new("MLC-3");
        assert!(!record.has_price());
        assert!(!record.has_coordinates());
        assert!(record.amenities.is_empty());
        assert_eq!(record.completeness_score, 0);
    }
}
