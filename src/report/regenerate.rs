use super::{ReportContext, ReportError, render};
use crate::config::RunConfig;
use crate::models::{AnalysisRecord, DetailRecord, EnrichedProduct, Review, SelectedProduct};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

const SELECTED: &str = "discovery-selected.json";
const REPORT: &str = "report.html";

/// Rebuilds `report.html` from the artifacts of an earlier run without
/// calling any provider. Only the selected product list is required; later
/// stage outputs are attached when present.
pub async fn regenerate(run_dir: &Path) -> Result<PathBuf, ReportError> {
    let selected: Vec<SelectedProduct> = read_json(&run_dir.join(SELECTED))
        .await?
        .ok_or_else(|| ReportError::Io {
            path: run_dir.join(SELECTED),
            source: ErrorKind::NotFound.into(),
        })?;
    let config: Option<RunConfig> = read_json(&run_dir.join("config.json")).await?;
    let details: Option<BTreeMap<String, DetailRecord>> =
        read_json(&run_dir.join("enrichment-output.json")).await?;
    let reviews: Option<Vec<Review>> = read_json(&run_dir.join("collection-output.json")).await?;
    let analyses: Option<Vec<AnalysisRecord>> =
        read_json(&run_dir.join("analysis-output.json")).await?;

    let context = match &config {
        Some(config) => ReportContext::from_config(config),
        None => {
            warn!(target = "insights.report", dir = %run_dir.display(), "no config snapshot, header values unknown");
            ReportContext::unknown()
        }
    };
    let products = assemble(selected, details, reviews, analyses);
    let html = render(&context, &products)?;

    let path = run_dir.join(REPORT);
    tokio::fs::write(&path, html)
        .await
        .map_err(|source| ReportError::Io {
            path: path.clone(),
            source,
        })?;
    info!(target = "insights.report", path = %path.display(), products = products.len(), "report regenerated");
    Ok(path)
}

/// Merges the per-stage artifacts back onto the selected products.
pub(crate) fn assemble(
    selected: Vec<SelectedProduct>,
    details: Option<BTreeMap<String, DetailRecord>>,
    reviews: Option<Vec<Review>>,
    analyses: Option<Vec<AnalysisRecord>>,
) -> Vec<EnrichedProduct> {
    let mut details = details.unwrap_or_default();
    let mut reviews_by_asin: HashMap<String, Vec<Review>> = HashMap::new();
    for review in reviews.unwrap_or_default() {
        reviews_by_asin
            .entry(review.asin.clone())
            .or_default()
            .push(review);
    }
    let mut analyses: HashMap<String, AnalysisRecord> = analyses
        .unwrap_or_default()
        .into_iter()
        .map(|record| (record.asin.clone(), record))
        .collect();

    selected
        .into_iter()
        .map(|product| {
            let asin = product.asin().to_string();
            let mut enriched = EnrichedProduct::new(product);
            if let Some(detail) = details.remove(&asin).and_then(|record| record.detail) {
                enriched.attach_detail(detail);
            }
            if let Some(reviews) = reviews_by_asin.remove(&asin) {
                enriched.attach_reviews(reviews);
            }
            if let Some(analysis) = analyses.remove(&asin).and_then(|record| record.analysis) {
                enriched.attach_analysis(analysis);
            }
            enriched
        })
        .collect()
}

/// The most recently written run directory that holds a selected product
/// list. Ties on modification time fall back to the name, which starts with
/// the run timestamp.
pub async fn latest_run(base_dir: &Path) -> Result<PathBuf, ReportError> {
    let io_error = |source| ReportError::Io {
        path: base_dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(base_dir).await.map_err(io_error)?;
    let mut latest: Option<(SystemTime, OsString, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
        let path = entry.path();
        let Ok(meta) = tokio::fs::metadata(path.join(SELECTED)).await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let candidate = (modified, entry.file_name(), path);
        if latest
            .as_ref()
            .is_none_or(|current| (&candidate.0, &candidate.1) > (&current.0, &current.1))
        {
            latest = Some(candidate);
        }
    }
    let (_, _, latest) = latest.ok_or_else(|| ReportError::NoRuns(base_dir.to_path_buf()))?;
    debug!(target = "insights.report", dir = %latest.display(), "latest run");
    Ok(latest)
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ReportError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(target = "insights.report", path = %path.display(), "artifact missing");
            return Ok(None);
        }
        Err(source) => {
            return Err(ReportError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| ReportError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisResult, ProductDetail, SearchResult};
    use serde_json::{Value, json};

    fn selected(rank: u32, asin: &str) -> SelectedProduct {
        SelectedProduct {
            rank,
            result: SearchResult {
                asin: asin.to_string(),
                title: format!("Listing {asin}"),
                rating: Some(4.0),
                review_count: Some(10),
                price: None,
                price_text: Some("$9.99".to_string()),
                link: None,
                thumbnail: None,
                raw: Value::Null,
            },
        }
    }

    fn write(dir: &Path, name: &str, value: &Value) {
        std::fs::write(dir.join(name), serde_json::to_vec(value).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn partial_run_is_renderable() {
        let tmp = tempfile::tempdir().unwrap();
        let products = vec![selected(1, "B2"), selected(2, "B1")];
        write(tmp.path(), SELECTED, &serde_json::to_value(&products).unwrap());
        write(
            tmp.path(),
            "enrichment-output.json",
            &json!({
                "B1": {"rank": 2, "title": "Listing B1", "detail": {"title": "Detailed B1"}},
                "B2": {"rank": 1, "title": "Listing B2", "error": "per-item timeout of 60s reached"}
            }),
        );

        let path = regenerate(tmp.path()).await.expect("regenerate");
        let html = std::fs::read_to_string(path).unwrap();
        assert!(html.contains("Detailed B1"));
        assert!(html.contains("Listing B2"));
        assert!(html.find("Listing B2").unwrap() < html.find("Detailed B1").unwrap());
        assert!(html.contains("Query: N/A"));
    }

    #[tokio::test]
    async fn missing_selection_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = regenerate(tmp.path()).await.expect_err("nothing to render");
        assert!(matches!(err, ReportError::Io { .. }));
    }

    #[tokio::test]
    async fn corrupt_artifact_is_a_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), SELECTED, &serde_json::to_value(vec![selected(1, "B1")]).unwrap());
        std::fs::write(tmp.path().join("analysis-output.json"), b"{oops").unwrap();
        let err = regenerate(tmp.path()).await.expect_err("corrupt");
        assert!(matches!(err, ReportError::Parse { .. }));
    }

    #[test]
    fn assemble_attaches_by_asin() {
        let reviews = vec![
            Review {
                asin: "B1".into(),
                product_title: Some("Listing B1".into()),
                title: None,
                text: "fine".into(),
                rating: Some(4.0),
                verified: false,
                posted_at: None,
            };
            3
        ];
        let analyses = vec![AnalysisRecord {
            asin: "B1".into(),
            product_title: "Listing B1".into(),
            review_count: 3,
            analysis: Some(AnalysisResult {
                strengths: vec!["Cheap".into()],
                concerns: vec![],
            }),
            response: None,
            error: None,
        }];
        let mut details = BTreeMap::new();
        details.insert(
            "B1".to_string(),
            DetailRecord {
                rank: 1,
                title: "Listing B1".into(),
                detail: Some(ProductDetail::default()),
                error: None,
            },
        );

        let products = assemble(
            vec![selected(1, "B1"), selected(2, "B2")],
            Some(details),
            Some(reviews),
            Some(analyses),
        );
        assert_eq!(products[0].reviews().len(), 3);
        assert!(products[0].detail.is_some());
        assert_eq!(products[0].analysis.as_ref().unwrap().strengths, vec!["Cheap"]);
        assert!(products[1].detail.is_none());
        assert!(products[1].reviews.is_none());
    }

    #[tokio::test]
    async fn latest_run_prefers_newest() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(matches!(latest_run(tmp.path()).await, Err(ReportError::NoRuns(_))));
        for name in ["20240101-000000-a", "20240102-000000-b"] {
            let dir = tmp.path().join(name);
            std::fs::create_dir(&dir).unwrap();
            write(&dir, SELECTED, &json!([]));
        }
        std::fs::create_dir(tmp.path().join("20990101-000000-empty")).unwrap();
        let latest = latest_run(tmp.path()).await.unwrap();
        assert!(latest.ends_with("20240102-000000-b"));
    }
}
