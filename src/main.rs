use portal_scout::config::ScrapeConfig;
use portal_scout::page::{ChromeSource, HttpSource, PageSource};
use portal_scout::session::SessionController;
use portal_scout::store::ListingStore;
use tracing::{info, warn, Level};

const SEARCH_URL: &str = "https://www.portalinmobiliario.com/venta/departamento/san-carlos-de-apoquindo-las-condes-santiago-metropolitana";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("🏠 Portal Scout - respectful listing scraper");
    info!("=============================================");

    // Conservative session: long delays, small caps, peak hours avoided
    let config = ScrapeConfig {
        min_delay: 4.0,
        max_delay: 8.0,
        max_requests_per_minute: 8,
        max_listings_per_session: 10,
        max_pages_per_session: 2,
        batch_save_size: 5,
        ..ScrapeConfig::default()
    };

    let store = ListingStore::open(&config.database_path)?;

    match ChromeSource::new() {
        Ok(source) => run_session(config, source, store).await,
        Err(e) => {
            warn!(error = %e, "Chrome unavailable, falling back to plain HTTP");
            run_session(config, HttpSource::new()?, store).await
        }
    }
}

async fn run_session<S: PageSource>(
    config: ScrapeConfig,
    source: S,
    store: ListingStore,
) -> anyhow::Result<()> {
    let mut controller = SessionController::new(config, source, store);

    info!("Starting session against {}", SEARCH_URL);
    let summary = controller.run(SEARCH_URL).await?;

    println!();
    println!("=== SESSION SUMMARY ===");
    println!("Final state: {:?}", summary.final_state);
    println!(
        "Pages: {} attempted, {} failed",
        summary.pages_attempted, summary.pages_failed
    );
    println!(
        "Listings: {} extracted, {} failed, {} saved, {} skipped",
        summary.listings_extracted,
        summary.listings_failed,
        summary.records_saved,
        summary.records_skipped
    );

    let store = controller.into_store();

    let coverage = store.field_coverage()?;
    println!();
    println!("=== STORE STATISTICS ===");
    println!(
        "{} records total ({} with price, {} with bedrooms, {} with area)",
        coverage.total, coverage.with_price, coverage.with_bedrooms, coverage.with_area
    );
    for stat in store.avg_price_by_bedrooms()? {
        println!(
            "  {} bedrooms: avg UF {:.0} across {} listings",
            stat.bedrooms, stat.avg_price_uf, stat.count
        );
    }
    println!("Scraped in the last 24h: {}", store.scraped_within(24)?);

    // Flat export snapshot for offline consumption
    let records = store.all_records()?;
    let json = serde_json::to_string_pretty(&records)?;
    tokio::fs::write("scraped_listings.json", json).await?;
    info!("💾 Saved {} records to scraped_listings.json", records.len());

    Ok(())
}
