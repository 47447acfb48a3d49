//! The stage operations. Each returns its value for the next stage plus the
//! artifacts the runner persists; none of them touch the run directory.

use super::coordinator::{BatchPolicy, ItemError, ItemResult, run_batch};
use super::run::Artifact;
use super::select::{SelectionCriteria, select};
use super::{PipelineError, StageOutcome};
use crate::models::{
    AnalysisRecord, AnalysisResult, DetailRecord, EnrichedProduct, ProductDetail, Review, Stage,
    SelectedProduct,
};
use crate::providers::{
    AnalysisProvider, AnalysisReply, AnalysisRequest, DetailProvider, ProviderError,
    ReviewProvider, SearchProvider, SearchRequest,
};
use crate::report::{self, ReportContext};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tracing::{info, warn};

pub(super) async fn discover(
    search: &dyn SearchProvider,
    request: &SearchRequest,
    criteria: &SelectionCriteria,
) -> Result<StageOutcome<Vec<SelectedProduct>>, PipelineError> {
    let results = search
        .search(request)
        .await
        .map_err(|err| PipelineError::provider(Stage::Discovery, err.to_string()))?;
    let selected = select(&results, criteria);
    info!(
        target = "insights.pipeline",
        found = results.len(),
        selected = selected.len(),
        "discovery finished"
    );

    let summary = json!({
        "query": request.query,
        "found": results.len(),
        "selected": selected.iter().map(SelectedProduct::asin).collect::<Vec<_>>(),
    });
    let artifacts = vec![
        Artifact::json("discovery-raw", &results),
        Artifact::json("discovery-selected", &selected),
    ];
    Ok(StageOutcome::new(selected, artifacts, summary))
}

pub(super) async fn enrich(
    detail: &dyn DetailProvider,
    products: &[EnrichedProduct],
    amazon_domain: &str,
    policy: BatchPolicy,
) -> Result<StageOutcome<Vec<Option<ProductDetail>>>, PipelineError> {
    let asins: Vec<String> = products.iter().map(|p| p.asin().to_string()).collect();
    let results = run_batch(asins, policy, |asin| async move {
        detail.product_detail(&asin, amazon_domain).await
    })
    .await;
    ensure_within_ceiling(Stage::Enrichment, &results)?;

    let records: BTreeMap<String, DetailRecord> = products
        .iter()
        .zip(&results)
        .map(|(product, result)| {
            let record = DetailRecord {
                rank: product.rank(),
                title: product.product.title().to_string(),
                detail: result.as_ref().ok().cloned(),
                error: result.as_ref().err().map(ToString::to_string),
            };
            (product.asin().to_string(), record)
        })
        .collect();
    let summary = batch_summary(Stage::Enrichment, products, &results, json!({}));
    let artifacts = vec![Artifact::json("enrichment-output", &records)];
    Ok(StageOutcome::new(into_values(results), artifacts, summary))
}

pub(super) async fn collect_reviews(
    reviews: &dyn ReviewProvider,
    products: &[EnrichedProduct],
    amazon_domain: &str,
    policy: BatchPolicy,
) -> Result<StageOutcome<Vec<Option<Vec<Review>>>>, PipelineError> {
    let items: Vec<(String, String)> = products
        .iter()
        .map(|p| (p.asin().to_string(), p.display_title().to_string()))
        .collect();
    let results = run_batch(items, policy, |(asin, title)| async move {
        let mut collected = reviews.reviews(&asin, amazon_domain).await?;
        for review in &mut collected {
            review.product_title = Some(title.clone());
        }
        Ok::<_, ProviderError>(collected)
    })
    .await;
    ensure_within_ceiling(Stage::Collection, &results)?;

    let flat: Vec<&Review> = results.iter().flatten().flatten().collect();
    let summary = batch_summary(
        Stage::Collection,
        products,
        &results,
        json!({ "source": reviews.name(), "reviews": flat.len() }),
    );
    let artifacts = vec![Artifact::json("collection-output", &flat)];
    Ok(StageOutcome::new(into_values(results), artifacts, summary))
}

/// Products whose review collection failed are still analyzed, with an
/// empty review list.
pub(super) async fn analyze(
    analysis: &dyn AnalysisProvider,
    products: &[EnrichedProduct],
    policy: BatchPolicy,
) -> Result<StageOutcome<Vec<Option<AnalysisResult>>>, PipelineError> {
    let items: Vec<&EnrichedProduct> = products.iter().collect();
    let results = run_batch(items, policy, |product| async move {
        let description = product
            .detail
            .as_ref()
            .map(ProductDetail::description)
            .unwrap_or_else(|| ProductDetail::default().description());
        let request = AnalysisRequest {
            title: product.display_title(),
            description: &description,
            reviews: product.reviews(),
        };
        analysis.analyze(&request).await
    })
    .await;
    ensure_within_ceiling(Stage::Analysis, &results)?;

    let records: Vec<AnalysisRecord> = products
        .iter()
        .zip(&results)
        .map(|(product, result)| AnalysisRecord {
            asin: product.asin().to_string(),
            product_title: product.display_title().to_string(),
            review_count: product.reviews().len(),
            analysis: result.as_ref().ok().map(|reply| reply.result.clone()),
            response: result.as_ref().ok().map(|reply| reply.text.clone()),
            error: result.as_ref().err().map(ToString::to_string),
        })
        .collect();
    let summary = batch_summary(Stage::Analysis, products, &results, json!({}));
    let artifacts = vec![Artifact::json("analysis-output", &records)];
    let values = results
        .into_iter()
        .map(|result| result.ok().map(|reply: AnalysisReply| reply.result))
        .collect();
    Ok(StageOutcome::new(values, artifacts, summary))
}

pub(super) async fn render(
    context: &ReportContext,
    products: &[EnrichedProduct],
) -> Result<StageOutcome<()>, PipelineError> {
    let html = report::render(context, products)
        .map_err(|err| PipelineError::render(Stage::Rendering, err.to_string()))?;
    let summary = json!({ "products": products.len(), "bytes": html.len() });
    Ok(StageOutcome::new((), vec![Artifact::html("report", html)], summary))
}

/// Item failures stay in their slots. The stage only fails when the batch
/// ceiling expired before any item succeeded.
fn ensure_within_ceiling<T>(stage: Stage, results: &[ItemResult<T>]) -> Result<(), PipelineError> {
    let cut = results
        .iter()
        .filter(|result| result.as_ref().is_err_and(ItemError::is_batch_timeout))
        .count();
    if cut == 0 || results.iter().any(Result::is_ok) {
        return Ok(());
    }
    Err(PipelineError::timeout(
        stage,
        format!(
            "batch timeout reached with no item finished ({cut} of {} cut short)",
            results.len()
        ),
    ))
}

fn batch_summary<T>(
    stage: Stage,
    products: &[EnrichedProduct],
    results: &[ItemResult<T>],
    mut extra: Value,
) -> Value {
    let failed: Vec<Value> = products
        .iter()
        .zip(results)
        .filter_map(|(product, result)| {
            let err = result.as_ref().err()?;
            warn!(
                target = "insights.pipeline",
                stage = %stage,
                asin = product.asin(),
                error = %err,
                "item failed"
            );
            Some(json!({ "asin": product.asin(), "error": err.to_string() }))
        })
        .collect();
    let succeeded = results.len() - failed.len();
    crate::metrics::batch_outcome(stage.as_str(), succeeded, failed.len());

    if let Value::Object(map) = &mut extra {
        map.insert("items".into(), json!(results.len()));
        map.insert("succeeded".into(), json!(succeeded));
        map.insert("failed".into(), Value::Array(failed));
    }
    extra
}

fn into_values<T>(results: Vec<ItemResult<T>>) -> Vec<Option<T>> {
    results.into_iter().map(Result::ok).collect()
}
