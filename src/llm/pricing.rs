use super::message::Usage;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

/// Used for models missing from the table. Priced at the top tier so unknown
/// models never look cheaper than they are.
pub const DEFAULT_PRICE: ModelPrice = ModelPrice {
    input_per_mtok: 15.0,
    output_per_mtok: 75.0,
};

/// Model name prefixes, most specific first.
const PRICES: &[(&str, ModelPrice)] = &[
    ("claude-opus-4", ModelPrice { input_per_mtok: 15.0, output_per_mtok: 75.0 }),
    ("claude-sonnet-4", ModelPrice { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
    ("claude-3-7-sonnet", ModelPrice { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
    ("claude-3-5-sonnet", ModelPrice { input_per_mtok: 3.0, output_per_mtok: 15.0 }),
    ("claude-haiku-4", ModelPrice { input_per_mtok: 1.0, output_per_mtok: 5.0 }),
    ("claude-3-5-haiku", ModelPrice { input_per_mtok: 0.8, output_per_mtok: 4.0 }),
    ("gpt-4o-mini", ModelPrice { input_per_mtok: 0.15, output_per_mtok: 0.6 }),
    ("gpt-4o", ModelPrice { input_per_mtok: 2.5, output_per_mtok: 10.0 }),
    ("gpt-4.1-mini", ModelPrice { input_per_mtok: 0.4, output_per_mtok: 1.6 }),
    ("gpt-4.1", ModelPrice { input_per_mtok: 2.0, output_per_mtok: 8.0 }),
    ("gpt-5-mini", ModelPrice { input_per_mtok: 0.25, output_per_mtok: 2.0 }),
    ("gpt-5", ModelPrice { input_per_mtok: 1.25, output_per_mtok: 10.0 }),
    ("o4-mini", ModelPrice { input_per_mtok: 1.1, output_per_mtok: 4.4 }),
    ("o3", ModelPrice { input_per_mtok: 2.0, output_per_mtok: 8.0 }),
];

pub fn price_for(model: &str) -> ModelPrice {
    PRICES
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICE)
}

pub fn cost(model: &str, usage: &Usage) -> f64 {
    let price = price_for(model);
    (usage.input_tokens as f64 * price.input_per_mtok
        + usage.output_tokens as f64 * price.output_per_mtok)
        / 1_000_000.0
}
