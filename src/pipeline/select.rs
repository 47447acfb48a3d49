//! Ranking of raw discovery results into the working set.

use crate::config::RunConfig;
use crate::models::{SearchResult, SelectedProduct};
use std::cmp::Ordering;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionCriteria {
    pub min_rating: Option<f64>,
    pub min_reviews: Option<u64>,
    pub limit: usize,
}

impl SelectionCriteria {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            min_rating: config.client_filters.min_rating,
            min_reviews: config.client_filters.min_reviews,
            limit: config.limit,
        }
    }
}

/// Dedups by ASIN (first occurrence wins), applies the client-side bounds,
/// orders by rating desc, review count desc, price asc and keeps the top
/// `limit`. A missing metric sorts as the worst value; it only excludes an
/// item when the matching bound is set.
pub fn select(results: &[SearchResult], criteria: &SelectionCriteria) -> Vec<SelectedProduct> {
    let mut seen = HashSet::new();
    let mut candidates: Vec<&SearchResult> = results
        .iter()
        .filter(|result| seen.insert(result.asin.clone()))
        .filter(|result| passes(result, criteria))
        .collect();

    candidates.sort_by(|a, b| compare(a, b));

    candidates
        .into_iter()
        .take(criteria.limit)
        .enumerate()
        .map(|(idx, result)| SelectedProduct {
            rank: idx as u32 + 1,
            result: result.clone(),
        })
        .collect()
}

fn passes(result: &SearchResult, criteria: &SelectionCriteria) -> bool {
    if let Some(min) = criteria.min_rating
        && !result.rating.is_some_and(|rating| rating >= min)
    {
        return false;
    }
    if let Some(min) = criteria.min_reviews
        && !result.review_count.is_some_and(|count| count >= min)
    {
        return false;
    }
    true
}

fn compare(a: &SearchResult, b: &SearchResult) -> Ordering {
    rating_key(b)
        .total_cmp(&rating_key(a))
        .then_with(|| b.review_count.unwrap_or(0).cmp(&a.review_count.unwrap_or(0)))
        .then_with(|| match (a.review_count, b.review_count) {
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        })
        .then_with(|| price_key(a).total_cmp(&price_key(b)))
}

fn rating_key(result: &SearchResult) -> f64 {
    result
        .rating
        .filter(|rating| !rating.is_nan())
        .unwrap_or(f64::NEG_INFINITY)
}

fn price_key(result: &SearchResult) -> f64 {
    result
        .price
        .filter(|price| !price.is_nan())
        .unwrap_or(f64::INFINITY)
}
