//! Salary normalization to EUR with one batched rate lookup per run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rjip_core::CanonicalListing;
use rjip_storage::SourceFetcher;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub const REPORTING_CURRENCY: &str = "EUR";

/// Currency code to the EUR value of one unit of that currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FxRateTable {
    rates: BTreeMap<String, f64>,
}

impl FxRateTable {
    pub fn new() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert(REPORTING_CURRENCY.to_string(), 1.0);
        Self { rates }
    }

    pub fn insert(&mut self, code: &str, rate_to_eur: f64) {
        if rate_to_eur.is_finite() && rate_to_eur > 0.0 {
            self.rates.insert(code.to_uppercase(), rate_to_eur);
        }
    }

    pub fn rate(&self, code: &str) -> Option<f64> {
        self.rates.get(&normalize_code(code)?).copied()
    }

    pub fn convert(&self, amount: Option<f64>, code: Option<&str>) -> Option<f64> {
        let amount = amount.filter(|a| a.is_finite())?;
        let rate = self.rate(code?)?;
        Some(((amount * rate) * 100.0).round() / 100.0)
    }
}

impl Default for FxRateTable {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_code(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_uppercase();
    (!code.is_empty()).then_some(code)
}

/// Distinct uppercase codes present in the batch, EUR excluded.
pub fn collect_currency_codes(listings: &[CanonicalListing]) -> BTreeSet<String> {
    listings
        .iter()
        .filter_map(|l| l.currency.as_deref().and_then(normalize_code))
        .filter(|code| code != REPORTING_CURRENCY)
        .collect()
}

/// Fills the `_eur` bounds. Unknown codes leave them `None`; original fields are untouched.
/// Returns how many listings received a conversion.
pub fn apply_rates(listings: &mut [CanonicalListing], table: &FxRateTable) -> usize {
    let mut converted = 0usize;
    for listing in listings.iter_mut() {
        let code = listing.currency.as_deref();
        listing.salary_min_eur = table.convert(listing.salary_min, code);
        listing.salary_max_eur = table.convert(listing.salary_max, code);
        if listing.salary_min_eur.is_some() || listing.salary_max_eur.is_some() {
            converted += 1;
        }
    }
    converted
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    /// One lookup covering every code in `codes`.
    async fn rates_to_eur(
        &self,
        run_id: Uuid,
        codes: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<FxRateTable>;
}

#[derive(Debug, Deserialize)]
struct LatestRates {
    #[serde(default)]
    rates: BTreeMap<String, f64>,
}

/// `exchangerate.host`-compatible provider, queried through the shared source fetcher.
pub struct ExchangeRateHost {
    base_url: String,
    http: Arc<dyn SourceFetcher>,
}

impl ExchangeRateHost {
    pub fn new(base_url: &str, http: Arc<dyn SourceFetcher>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    pub fn latest_url(&self, codes: &BTreeSet<String>) -> String {
        let symbols = codes.iter().cloned().collect::<Vec<_>>().join(",");
        format!(
            "{}/latest?base={REPORTING_CURRENCY}&symbols={symbols}",
            self.base_url
        )
    }
}

#[async_trait]
impl RateProvider for ExchangeRateHost {
    async fn rates_to_eur(
        &self,
        run_id: Uuid,
        codes: &BTreeSet<String>,
        cancel: &CancellationToken,
    ) -> Result<FxRateTable> {
        let mut table = FxRateTable::new();
        if codes.is_empty() {
            return Ok(table);
        }
        let url = self.latest_url(codes);
        let resp = self
            .http
            .fetch_text(run_id, "fx", &url, cancel)
            .await
            .with_context(|| format!("fetching rates from {url}"))?;
        let latest: LatestRates =
            serde_json::from_str(&resp.body).context("decoding rate payload")?;
        if latest.rates.is_empty() {
            bail!("rate payload from {url} has no rates");
        }
        // Quoted as units per EUR; invert to EUR per unit.
        for (code, per_eur) in latest.rates {
            if per_eur > 0.0 {
                table.insert(&code, 1.0 / per_eur);
            }
        }
        Ok(table)
    }
}

/// Fixed table, for tests and offline runs.
#[derive(Debug, Clone)]
pub struct StaticRates {
    table: FxRateTable,
}

impl StaticRates {
    pub fn new(rates: &[(&str, f64)]) -> Self {
        let mut table = FxRateTable::new();
        for (code, rate) in rates {
            table.insert(code, *rate);
        }
        Self { table }
    }
}

#[async_trait]
impl RateProvider for StaticRates {
    async fn rates_to_eur(
        &self,
        _run_id: Uuid,
        codes: &BTreeSet<String>,
        _cancel: &CancellationToken,
    ) -> Result<FxRateTable> {
        let mut table = FxRateTable::new();
        for code in codes {
            if let Some(rate) = self.table.rate(code) {
                table.insert(code, rate);
            }
        }
        Ok(table)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FxReport {
    pub codes: Vec<String>,
    pub resolved: Vec<String>,
    pub converted: usize,
    pub error: Option<String>,
}

pub struct CurrencyNormalizer {
    provider: Arc<dyn RateProvider>,
}

impl CurrencyNormalizer {
    pub fn new(provider: Arc<dyn RateProvider>) -> Self {
        Self { provider }
    }

    /// Converts salary bounds in place. A provider failure degrades to EUR-only conversion.
    pub async fn normalize(
        &self,
        run_id: Uuid,
        listings: &mut [CanonicalListing],
        cancel: &CancellationToken,
    ) -> FxReport {
        let codes = collect_currency_codes(listings);
        let mut report = FxReport {
            codes: codes.iter().cloned().collect(),
            ..FxReport::default()
        };

        let table = if codes.is_empty() {
            FxRateTable::new()
        } else {
            match self.provider.rates_to_eur(run_id, &codes, cancel).await {
                Ok(table) => table,
                Err(err) => {
                    warn!(codes = ?report.codes, error = %format!("{err:#}"), "rate lookup failed");
                    report.error = Some(format!("{err:#}"));
                    FxRateTable::new()
                }
            }
        };

        report.resolved = codes
            .iter()
            .filter(|code| table.rate(code).is_some())
            .cloned()
            .collect();
        report.converted = apply_rates(listings, &table);
        info!(
            codes = report.codes.len(),
            resolved = report.resolved.len(),
            converted = report.converted,
            "salary bounds normalized to EUR"
        );
        report
    }
}
