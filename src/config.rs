use serde::{Deserialize, Serialize};

/// Configuration for one scraping session.
///
/// Defaults are deliberately conservative: long delays, small session caps,
/// peak-hour avoidance on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Minimum delay between page requests, seconds
    pub min_delay: f64,
    /// Maximum delay between page requests, seconds
    pub max_delay: f64,
    /// Rolling ceiling over a trailing 60-second window
    pub max_requests_per_minute: u32,

    /// Session caps
    pub max_listings_per_session: usize,
    pub max_pages_per_session: usize,

    /// Time restrictions (local time)
    pub avoid_peak_hours: bool,
    pub peak_start_hour: u32,
    pub peak_end_hour: u32,

    /// Data extraction toggles
    pub extract_coordinates: bool,
    pub validate_data: bool,

    /// Records accumulated before a flush to the store
    pub batch_save_size: usize,

    /// Fraction of failed pages/listings that aborts the session
    pub max_failure_rate: f64,

    /// SQLite database location
    pub database_path: String,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            min_delay: 3.0,
            max_delay: 8.0,
            max_requests_per_minute: 10,
            max_listings_per_session: 100,
            max_pages_per_session: 10,
            avoid_peak_hours: true,
            peak_start_hour: 9,
            peak_end_hour: 18,
            extract_coordinates: true,
            validate_data: true,
            batch_save_size: 50,
            max_failure_rate: 0.3,
            database_path: "listings.db".to_string(),
        }
    }
}
