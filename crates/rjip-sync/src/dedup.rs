//! Freshness filter and the two dedup phases.

use std::collections::HashSet;

use chrono::{DateTime, TimeDelta, Utc};
use rjip_core::CanonicalListing;

/// Oldest `posted_at` still eligible for this run.
pub fn freshness_cutoff(now: DateTime<Utc>, max_age_days: u32) -> DateTime<Utc> {
    TimeDelta::try_days(i64::from(max_age_days))
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Keeps listings posted at or after `cutoff`. Undated listings count as stale.
/// Returns the kept listings and the number dropped.
pub fn filter_fresh(
    listings: Vec<CanonicalListing>,
    cutoff: DateTime<Utc>,
) -> (Vec<CanonicalListing>, usize) {
    let before = listings.len();
    let kept: Vec<_> = listings
        .into_iter()
        .filter(|listing| listing.posted_at.is_some_and(|at| at >= cutoff))
        .collect();
    let stale = before - kept.len();
    (kept, stale)
}

/// Phase 1: one listing per `(source_id, external_id)`, first occurrence wins, encounter order
/// preserved.
pub fn dedup_per_source(listings: Vec<CanonicalListing>) -> Vec<CanonicalListing> {
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|listing| seen.insert(listing.local_key()))
        .collect()
}

/// Phase 2: one listing per global key across all sources. The batch is stably sorted
/// newest-first before the first-wins pass, so each survivor is the most recent posting of its
/// key.
pub fn dedup_global(mut listings: Vec<CanonicalListing>) -> Vec<CanonicalListing> {
    // Option orders None first; reversing puts undated listings last.
    listings.sort_by(|a, b| b.posted_at.cmp(&a.posted_at));
    let mut seen = HashSet::new();
    listings
        .into_iter()
        .filter(|listing| seen.insert(listing.global_key()))
        .collect()
}

pub fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{Duration, TimeZone};
    use rjip_core::{ContractType, RemoteType};

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn listing(
        source: &str,
        external_id: &str,
        url: &str,
        posted_at: Option<DateTime<Utc>>,
    ) -> CanonicalListing {
        CanonicalListing {
            source_id: source.into(),
            external_id: external_id.into(),
            title: format!("Job {external_id}"),
            company: "Acme".into(),
            company_logo: None,
            location: None,
            contract_type: ContractType::FullTime,
            category: None,
            description: None,
            requirements: None,
            benefits: None,
            salary_min: None,
            salary_max: None,
            currency: None,
            salary_min_eur: None,
            salary_max_eur: None,
            is_remote: true,
            remote_type: RemoteType::FullyRemote,
            experience_level: None,
            posted_at,
            deadline: None,
            url: url.into(),
            source_url: url.into(),
            featured: false,
            tags: vec![],
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn freshness_boundary_is_inclusive() {
        let cutoff = freshness_cutoff(now(), 45);
        assert_eq!(cutoff, now() - Duration::days(45));

        let batch = vec![
            listing("a", "at-cutoff", "https://a/1", Some(cutoff)),
            listing(
                "a",
                "just-before",
                "https://a/2",
                Some(cutoff - Duration::milliseconds(1)),
            ),
            listing("a", "undated", "https://a/3", None),
            listing("a", "recent", "https://a/4", Some(now())),
        ];
        let (kept, stale) = filter_fresh(batch, cutoff);
        let ids: Vec<_> = kept.iter().map(|l| l.external_id.as_str()).collect();
        assert_eq!(ids, vec!["at-cutoff", "recent"]);
        assert_eq!(stale, 2);
    }

    #[test]
    fn forty_six_day_old_listing_is_stale_at_forty_five_days() {
        let cutoff = freshness_cutoff(now(), 45);
        let (kept, stale) = filter_fresh(
            vec![listing("a", "old", "https://a/1", Some(now() - Duration::days(46)))],
            cutoff,
        );
        assert!(kept.is_empty());
        assert_eq!(stale, 1);
    }

    #[test]
    fn per_source_dedup_keeps_first_occurrence() {
        let mut first = listing("a", "1", "https://a/1", Some(now()));
        first.title = "first".into();
        let mut second = listing("a", "1", "https://a/1", Some(now()));
        second.title = "second".into();
        let other = listing("a", "2", "https://a/2", Some(now()));

        let out = dedup_per_source(vec![first, other, second]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].title, "first");
        assert_eq!(out[1].external_id, "2");
    }

    #[test]
    fn global_dedup_merges_fragment_and_case_variants() {
        let out = dedup_global(vec![
            listing("wwr", "1", "https://x.com/job/42", Some(now())),
            listing(
                "remotive",
                "9",
                "https://X.com/job/42#ref=twitter",
                Some(now() - Duration::hours(1)),
            ),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source_id, "wwr");
    }

    #[test]
    fn global_dedup_retains_newest_for_every_input_order() {
        let stamps = [
            now() - Duration::days(3),
            now(),
            now() - Duration::milliseconds(1),
        ];
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let batch = order
                .iter()
                .map(|&i| {
                    listing(
                        &format!("src{i}"),
                        &i.to_string(),
                        "https://x.com/job/7/",
                        Some(stamps[i]),
                    )
                })
                .collect();
            let out = dedup_global(batch);
            assert_eq!(out.len(), 1, "order {order:?}");
            assert_eq!(out[0].posted_at, Some(now()), "order {order:?}");
        }
    }

    #[test]
    fn ratio_guards_zero_denominator() {
        assert_eq!(ratio(3, 0), 0.0);
        assert_eq!(ratio(1, 4), 0.25);
    }
}
