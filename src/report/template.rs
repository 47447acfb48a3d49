//! Static page shell and per-product card markup.

use super::ReportContext;

const STYLE: &str = r#"
        * { margin: 0; padding: 0; box-sizing: border-box; }
        body {
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, Ubuntu, sans-serif;
            line-height: 1.6;
            color: #333;
            background-color: #f5f5f5;
            padding: 20px;
        }
        .container {
            max-width: 1200px;
            margin: 0 auto;
            background-color: #fff;
            padding: 40px;
            border-radius: 8px;
            box-shadow: 0 2px 8px rgba(0, 0, 0, 0.1);
        }
        header { border-bottom: 3px solid #ff9900; padding-bottom: 20px; margin-bottom: 30px; }
        h1 { color: #232f3e; font-size: 2.2em; margin-bottom: 15px; }
        .generated { color: #777; font-size: 0.85em; margin-bottom: 15px; }
        .filter-params { background-color: #f8f9fa; padding: 15px; border-radius: 6px; border-left: 4px solid #ff9900; }
        .filter-params h2 { font-size: 1.1em; color: #232f3e; margin-bottom: 10px; }
        .filter-grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(200px, 1fr)); gap: 10px; }
        .filter-item { font-size: 0.9em; }
        .filter-label, .meta-label { font-weight: 600; color: #555; }
        .product-card { border: 1px solid #ddd; border-radius: 8px; margin-bottom: 25px; padding: 20px; background-color: #fafafa; }
        .product-header { display: flex; gap: 20px; margin-bottom: 20px; padding-bottom: 15px; border-bottom: 2px solid #e0e0e0; }
        .product-image { flex-shrink: 0; }
        .product-image img { width: 150px; height: 150px; object-fit: contain; border: 1px solid #ddd; border-radius: 4px; background-color: #fff; }
        .product-info { flex-grow: 1; }
        .rank { display: inline-block; background-color: #232f3e; color: #fff; border-radius: 4px; padding: 0 8px; margin-right: 8px; font-size: 0.8em; }
        .product-title { font-size: 1.3em; color: #232f3e; margin-bottom: 10px; font-weight: 600; }
        .product-title a { color: #007185; text-decoration: none; }
        .product-title a:hover { color: #c45500; text-decoration: underline; }
        .product-meta { display: flex; gap: 20px; margin-top: 10px; flex-wrap: wrap; }
        .meta-item { font-size: 0.95em; }
        .rating { color: #ff9900; font-weight: 700; }
        .price { color: #b12704; font-weight: 700; }
        .analysis { display: grid; grid-template-columns: 1fr 1fr; gap: 15px; margin-top: 15px; }
        .analysis-column { background-color: #fff; padding: 15px; border-radius: 6px; border: 1px solid #e0e0e0; }
        .strengths { border-left: 4px solid #067d62; }
        .concerns { border-left: 4px solid #d13212; }
        .analysis-column h3 { margin-bottom: 10px; font-size: 1.05em; }
        .strengths h3 { color: #067d62; }
        .concerns h3 { color: #d13212; }
        .analysis-column ul { list-style: none; }
        .analysis-column li { padding: 5px 0 5px 20px; position: relative; font-size: 0.9em; }
        .strengths li:before { content: "+"; position: absolute; left: 0; color: #067d62; font-weight: bold; }
        .concerns li:before { content: "-"; position: absolute; left: 0; color: #d13212; font-weight: bold; }
        .empty { color: #777; font-style: italic; font-size: 0.9em; }
        @media (max-width: 768px) {
            .product-header { flex-direction: column; }
            .analysis, .filter-grid { grid-template-columns: 1fr; }
        }
"#;

/// Card fields, already escaped and formatted.
pub(super) struct Card {
    pub rank: u32,
    pub title: String,
    pub link: String,
    pub image: Option<String>,
    pub asin: String,
    pub rating: String,
    pub review_count: String,
    pub price: String,
    pub collected: usize,
    pub strengths: String,
    pub concerns: String,
}

pub(super) fn page(context: &ReportContext, cards: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Product Review Insights: {query}</title>
    <style>{style}</style>
</head>
<body>
    <div class="container">
        <header>
            <h1>Query: {query}</h1>
            <p class="generated">Generated {generated}</p>
            <div class="filter-params">
                <h2>Filter Parameters</h2>
                <div class="filter-grid">
                    {domain}
                    {shipping}
                    {price_range}
                    {min_rating}
                    {min_reviews}
                </div>
            </div>
        </header>
        <main>
{cards}
        </main>
    </div>
</body>
</html>
"#,
        query = context.query,
        style = STYLE,
        generated = context.generated_at.format("%Y-%m-%d %H:%M UTC"),
        domain = filter_item("Domain", &context.amazon_domain),
        shipping = filter_item("Shipping", &context.shipping_type),
        price_range = filter_item("Price Range", &context.price_range),
        min_rating = filter_item("Min Rating", &context.min_rating),
        min_reviews = filter_item("Min Reviews", &context.min_reviews),
        cards = cards,
    )
}

fn filter_item(label: &str, value: &str) -> String {
    format!(
        r#"<div class="filter-item"><span class="filter-label">{label}:</span> <span class="filter-value">{value}</span></div>"#
    )
}

pub(super) fn card(card: &Card) -> String {
    let image = match &card.image {
        Some(src) => format!(
            r#"<div class="product-image"><img src="{src}" alt="{alt}"></div>"#,
            alt = card.title
        ),
        None => String::new(),
    };
    format!(
        r#"            <div class="product-card" id="rank-{rank}">
                <div class="product-header">
                    {image}
                    <div class="product-info">
                        <h2 class="product-title"><span class="rank">#{rank}</span><a href="{link}" target="_blank" rel="noopener">{title}</a></h2>
                        <div class="product-meta">
                            <div class="meta-item"><span class="meta-label">ASIN:</span> <span>{asin}</span></div>
                            <div class="meta-item"><span class="meta-label">Rating:</span> <span class="rating">{rating}</span></div>
                            <div class="meta-item"><span class="meta-label">Reviews:</span> <span>{review_count}</span></div>
                            <div class="meta-item"><span class="meta-label">Price:</span> <span class="price">{price}</span></div>
                            <div class="meta-item"><span class="meta-label">Reviews analyzed:</span> <span>{collected}</span></div>
                        </div>
                    </div>
                </div>
                <div class="analysis">
                    <div class="analysis-column strengths">
                        <h3>Product Strengths</h3>
                        {strengths}
                    </div>
                    <div class="analysis-column concerns">
                        <h3>Product Concerns</h3>
                        {concerns}
                    </div>
                </div>
            </div>
"#,
        rank = card.rank,
        image = image,
        link = card.link,
        title = card.title,
        asin = card.asin,
        rating = card.rating,
        review_count = card.review_count,
        price = card.price,
        collected = card.collected,
        strengths = card.strengths,
        concerns = card.concerns,
    )
}

/// `items` must already be escaped.
pub(super) fn finding_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return format!(r#"<p class="empty">{empty}</p>"#);
    }
    let rows: String = items.iter().map(|item| format!("<li>{item}</li>")).collect();
    format!("<ul>{rows}</ul>")
}
