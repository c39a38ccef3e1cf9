//! Deduplicating SQLite persistence for listing records.
//!
//! The sole write primitive is the upsert keyed by `listing_id`. A re-scrape
//! overwrites columns it resolved and keeps previously captured values where
//! the fresh record is null, so completeness never silently regresses.

use std::path::Path;

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::warn;

use crate::models::{Currency, ListingRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result of a batch write. A rejected record never aborts the rest of the
/// batch; already-applied rows always survive.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub saved: usize,
    pub skipped: Vec<(String, StoreError)>,
}

/// Per-field population counts, for coverage reporting.
#[derive(Debug, Clone)]
pub struct FieldCoverage {
    pub total: u64,
    pub with_price: u64,
    pub with_bedrooms: u64,
    pub with_area: u64,
}

/// Average price grouped by bedroom count (UF-priced listings only).
#[derive(Debug, Clone, PartialEq)]
pub struct BedroomPriceStat {
    pub bedrooms: u32,
    pub avg_price_uf: f64,
    pub count: u64,
}

/// SQLite-backed record store. One connection per session, owned by the
/// session controller; connections are not shared across writers.
pub struct ListingStore {
    conn: Connection,
}

impl ListingStore {
    /// Open (or create) the store at `path`. Use `:memory:` in tests.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open(":memory:")
    }

    /// Insert or overwrite one record, keyed by `listing_id`.
    ///
    /// Optional columns merge through `COALESCE(excluded, existing)`; the
    /// completeness score keeps the larger of the two values, so a sparser
    /// re-scrape cannot regress a previously captured row.
    pub fn upsert(&self, record: &ListingRecord) -> Result<(), StoreError> {
        let id = record.listing_id.trim();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(StoreError::InvalidRecord(format!(
                "malformed listing_id {:?}",
                record.listing_id
            )));
        }

        let amenities = serde_json::to_string(&record.amenities)?;
        let issues = serde_json::to_string(&record.issues)?;

        self.conn.execute(
            "INSERT INTO listings (
                listing_id, title, url, price_raw, price_uf, price_clp, currency,
                maintenance_fee, bedrooms, bathrooms, total_area_m2, built_area_m2,
                parking_spots, address, neighborhood, comuna, latitude, longitude,
                building_age, total_floors, floor_number, has_elevator, amenities,
                has_pool, has_gym, has_security, scraped_at, completeness_score, issues
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15,
                      ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)
            ON CONFLICT(listing_id) DO UPDATE SET
                title = COALESCE(excluded.title, title),
                url = COALESCE(excluded.url, url),
                price_raw = COALESCE(excluded.price_raw, price_raw),
                price_uf = COALESCE(excluded.price_uf, price_uf),
                price_clp = COALESCE(excluded.price_clp, price_clp),
                currency = COALESCE(excluded.currency, currency),
                maintenance_fee = COALESCE(excluded.maintenance_fee, maintenance_fee),
                bedrooms = COALESCE(excluded.bedrooms, bedrooms),
                bathrooms = COALESCE(excluded.bathrooms, bathrooms),
                total_area_m2 = COALESCE(excluded.total_area_m2, total_area_m2),
                built_area_m2 = COALESCE(excluded.built_area_m2, built_area_m2),
                parking_spots = COALESCE(excluded.parking_spots, parking_spots),
                address = COALESCE(excluded.address, address),
                neighborhood = COALESCE(excluded.neighborhood, neighborhood),
                comuna = COALESCE(excluded.comuna, comuna),
                latitude = COALESCE(excluded.latitude, latitude),
                longitude = COALESCE(excluded.longitude, longitude),
                building_age = COALESCE(excluded.building_age, building_age),
                total_floors = COALESCE(excluded.total_floors, total_floors),
                floor_number = COALESCE(excluded.floor_number, floor_number),
                has_elevator = COALESCE(excluded.has_elevator, has_elevator),
                amenities = CASE WHEN excluded.amenities != '[]'
                            THEN excluded.amenities ELSE amenities END,
                has_pool = COALESCE(excluded.has_pool, has_pool),
                has_gym = COALESCE(excluded.has_gym, has_gym),
                has_security = COALESCE(excluded.has_security, has_security),
                scraped_at = excluded.scraped_at,
                completeness_score = MAX(completeness_score, excluded.completeness_score),
                issues = excluded.issues",
            params![
                id,
                record.title,
                record.url,
                record.price_raw,
                record.price_uf,
                record.price_clp,
                record.currency.map(currency_to_str),
                record.maintenance_fee,
                record.bedrooms,
                record.bathrooms,
                record.total_area_m2,
                record.built_area_m2,
                record.parking_spots,
                record.address,
                record.neighborhood,
                record.comuna,
                record.latitude,
                record.longitude,
                record.building_age,
                record.total_floors,
                record.floor_number,
                record.has_elevator,
                amenities,
                record.has_pool,
                record.has_gym,
                record.has_security,
                timestamp_to_str(record.scraped_at),
                record.completeness_score,
                issues,
            ],
        )?;

        Ok(())
    }

    /// Apply `upsert` per record. Failures are reported and skipped; the
    /// batch never aborts partway.
    pub fn upsert_batch(&self, records: &[ListingRecord]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for record in records {
            match self.upsert(record) {
                Ok(()) => outcome.saved += 1,
                Err(e) => {
                    warn!(listing_id = %record.listing_id, error = %e, "record skipped");
                    outcome.skipped.push((record.listing_id.clone(), e));
                }
            }
        }
        outcome
    }

    pub fn get(&self, listing_id: &str) -> Result<Option<ListingRecord>, StoreError> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM listings WHERE listing_id = ?1"),
                params![listing_id],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM listings", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Flat export snapshot: every record, ordered by listing id. Agrees
    /// field-for-field with the keyed rows.
    pub fn all_records(&self) -> Result<Vec<ListingRecord>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {COLUMNS} FROM listings ORDER BY listing_id"))?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Average UF price grouped by bedroom count.
    pub fn avg_price_by_bedrooms(&self) -> Result<Vec<BedroomPriceStat>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT bedrooms, AVG(price_uf), COUNT(*)
             FROM listings
             WHERE bedrooms IS NOT NULL AND price_uf IS NOT NULL
             GROUP BY bedrooms
             ORDER BY bedrooms",
        )?;
        let stats = stmt
            .query_map([], |row| {
                Ok(BedroomPriceStat {
                    bedrooms: row.get(0)?,
                    avg_price_uf: row.get(1)?,
                    count: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    /// Records scraped within the trailing `hours` window.
    pub fn scraped_within(&self, hours: i64) -> Result<u64, StoreError> {
        let cutoff = timestamp_to_str(Utc::now() - Duration::hours(hours));
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM listings WHERE scraped_at >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Population counts for the fields that matter most downstream.
    pub fn field_coverage(&self) -> Result<FieldCoverage, StoreError> {
        self.conn
            .query_row(
                "SELECT COUNT(*),
                        COUNT(currency),
                        COUNT(bedrooms),
                        COUNT(total_area_m2)
                 FROM listings",
                [],
                |row| {
                    Ok(FieldCoverage {
                        total: row.get::<_, i64>(0)? as u64,
                        with_price: row.get::<_, i64>(1)? as u64,
                        with_bedrooms: row.get::<_, i64>(2)? as u64,
                        with_area: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .map_err(StoreError::from)
    }
}

const COLUMNS: &str = "listing_id, title, url, price_raw, price_uf, price_clp, currency, \
    maintenance_fee, bedrooms, bathrooms, total_area_m2, built_area_m2, parking_spots, \
    address, neighborhood, comuna, latitude, longitude, building_age, total_floors, \
    floor_number, has_elevator, amenities, has_pool, has_gym, has_security, scraped_at, \
    completeness_score, issues";

fn currency_to_str(currency: Currency) -> &'static str {
    match currency {
        Currency::Uf => "UF",
        Currency::Clp => "CLP",
    }
}

fn str_to_currency(s: &str) -> Option<Currency> {
    match s {
        "UF" => Some(Currency::Uf),
        "CLP" => Some(Currency::Clp),
        _ => None,
    }
}

/// Fixed-width UTC timestamps, so lexicographic order is chronological.
fn timestamp_to_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<ListingRecord> {
    let currency: Option<String> = row.get(6)?;
    let amenities_json: String = row.get(22)?;
    let scraped_at: String = row.get(26)?;
    let issues_json: String = row.get(28)?;

    let amenities: Vec<String> = serde_json::from_str(&amenities_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(22, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let issues: Vec<String> = serde_json::from_str(&issues_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(28, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let scraped_at = DateTime::parse_from_rfc3339(&scraped_at)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(26, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);

    Ok(ListingRecord {
        listing_id: row.get(0)?,
        title: row.get(1)?,
        url: row.get(2)?,
        price_raw: row.get(3)?,
        price_uf: row.get(4)?,
        price_clp: row.get(5)?,
        currency: currency.as_deref().and_then(str_to_currency),
        maintenance_fee: row.get(7)?,
        bedrooms: row.get(8)?,
        bathrooms: row.get(9)?,
        total_area_m2: row.get(10)?,
        built_area_m2: row.get(11)?,
        parking_spots: row.get(12)?,
        address: row.get(13)?,
        neighborhood: row.get(14)?,
        comuna: row.get(15)?,
        latitude: row.get(16)?,
        longitude: row.get(17)?,
        building_age: row.get(18)?,
        total_floors: row.get(19)?,
        floor_number: row.get(20)?,
        has_elevator: row.get(21)?,
        amenities,
        has_pool: row.get(23)?,
        has_gym: row.get(24)?,
        has_security: row.get(25)?,
        scraped_at,
        completeness_score: row.get(27)?,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Currency;

    fn sample_record(id: &str) -> ListingRecord {
        let mut record = ListingRecord::new(id);
        record.title = Some("Departamento en Las Condes".to_string());
        record.url = Some(format!("https://example.cl/{id}"));
        record.set_price(Currency::Uf, 5300.0);
        record.price_raw = Some("UF 5.300".to_string());
        record.bedrooms = Some(3);
        record.bathrooms = Some(2);
        record.total_area_m2 = Some(82.5);
        record.comuna = Some("Las Condes".to_string());
        record.amenities = vec!["gym".to_string(), "pool".to_string()];
        record.completeness_score = 80;
        record
    }

    #[test]
    fn upsert_is_idempotent() {
        let store = ListingStore::in_memory().unwrap();
        let record = sample_record("MLC-1");

        store.upsert(&record).unwrap();
        let first = store.get("MLC-1").unwrap().unwrap();

        store.upsert(&record).unwrap();
        let second = store.get("MLC-1").unwrap().unwrap();

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(first, second);
        assert_eq!(second.price_uf, Some(5300.0));
        assert_eq!(second.amenities, vec!["gym", "pool"]);
    }

    #[test]
    fn rescrape_never_loses_captured_fields() {
        let store = ListingStore::in_memory().unwrap();
        store.upsert(&sample_record("MLC-2")).unwrap();

        // A sparser re-scrape: price resolved, everything else missed
        let mut sparse = ListingRecord::new("MLC-2");
        sparse.set_price(Currency::Uf, 5400.0);
        sparse.completeness_score = 25;
        store.upsert(&sparse).unwrap();

        let merged = store.get("MLC-2").unwrap().unwrap();
        // fresher non-null value overwrites
        assert_eq!(merged.price_uf, Some(5400.0));
        // previously captured fields survive the sparse re-scrape
        assert_eq!(merged.bedrooms, Some(3));
        assert_eq!(merged.total_area_m2, Some(82.5));
        assert_eq!(merged.amenities, vec!["gym", "pool"]);
        // the score never regresses when fields are only added
        assert_eq!(merged.completeness_score, 80);
    }

    #[test]
    fn malformed_identifier_is_rejected() {
        let store = ListingStore::in_memory().unwrap();
        let bad = ListingRecord::new("   ");
        assert!(matches!(
            store.upsert(&bad),
            Err(StoreError::InvalidRecord(_))
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn batch_skips_bad_records_without_aborting() {
        let store = ListingStore::in_memory().unwrap();
        let records = vec![
            sample_record("MLC-10"),
            ListingRecord::new(""),
            sample_record("MLC-11"),
        ];

        let outcome = store.upsert_batch(&records);
        assert_eq!(outcome.saved, 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(store.count().unwrap(), 2);
        assert!(store.get("MLC-11").unwrap().is_some());
    }

    #[test]
    fn amenities_round_trip_losslessly() {
        let store = ListingStore::in_memory().unwrap();
        let mut record = sample_record("MLC-3");
        record.amenities = vec![
            "bbq area".to_string(),
            "pool".to_string(),
            "security".to_string(),
        ];
        record.issues = vec!["missing coordinates".to_string()];
        store.upsert(&record).unwrap();

        let loaded = store.get("MLC-3").unwrap().unwrap();
        assert_eq!(loaded.amenities, record.amenities);
        assert_eq!(loaded.issues, record.issues);
    }

    #[test]
    fn flat_export_agrees_with_keyed_rows() {
        let store = ListingStore::in_memory().unwrap();
        store.upsert(&sample_record("MLC-20")).unwrap();
        store.upsert(&sample_record("MLC-21")).unwrap();

        let all = store.all_records().unwrap();
        assert_eq!(all.len(), 2);
        for record in &all {
            let keyed = store.get(&record.listing_id).unwrap().unwrap();
            assert_eq!(*record, keyed);
        }
        // ordered snapshot
        assert!(all[0].listing_id < all[1].listing_id);
    }

    #[test]
    fn aggregates_group_by_bedrooms() {
        let store = ListingStore::in_memory().unwrap();
        let mut a = sample_record("MLC-30");
        a.bedrooms = Some(2);
        a.price_uf = Some(5000.0);
        let mut b = sample_record("MLC-31");
        b.bedrooms = Some(2);
        b.price_uf = Some(7000.0);
        let mut c = sample_record("MLC-32");
        c.bedrooms = Some(3);
        c.price_uf = Some(9000.0);
        store.upsert_batch(&[a, b, c]);

        let stats = store.avg_price_by_bedrooms().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].bedrooms, 2);
        assert_eq!(stats[0].avg_price_uf, 6000.0);
        assert_eq!(stats[0].count, 2);
        assert_eq!(stats[1].bedrooms, 3);
        assert_eq!(stats[1].avg_price_uf, 9000.0);
    }

    #[test]
    fn freshness_window_counts_recent_rows() {
        let store = ListingStore::in_memory().unwrap();

        let fresh = sample_record("MLC-40");
        let mut stale = sample_record("MLC-41");
        stale.scraped_at = Utc::now() - Duration::hours(48);
        store.upsert_batch(&[fresh, stale]);

        assert_eq!(store.scraped_within(24).unwrap(), 1);
        assert_eq!(store.scraped_within(72).unwrap(), 2);
    }

    #[test]
    fn coverage_counts_populated_fields() {
        let store = ListingStore::in_memory().unwrap();
        let full = sample_record("MLC-50");
        let empty = ListingRecord::new("MLC-51");
        store.upsert_batch(&[full, empty]);

        let coverage = store.field_coverage().unwrap();
        assert_eq!(coverage.total, 2);
        assert_eq!(coverage.with_price, 1);
        assert_eq!(coverage.with_bedrooms, 1);
        assert_eq!(coverage.with_area, 1);
    }

    #[test]
    fn store_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.db");

        {
            let store = ListingStore::open(&path).unwrap();
            store.upsert(&sample_record("MLC-60")).unwrap();
        }

        let reopened = ListingStore::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
        assert!(reopened.get("MLC-60").unwrap().is_some());
    }
}
