//! Per-model token pricing (USD per token).

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Look up (input, output) cost per token for a model.
///
/// Unknown and `:free` models cost nothing.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    if model.ends_with(":free") {
        return (Decimal::ZERO, Decimal::ZERO);
    }
    let per_million = match model {
        m if m.starts_with("qwen-3-coder-480b") => Some((dec!(2.00), dec!(2.00))),
        m if m.starts_with("llama3.1-8b") => Some((dec!(0.10), dec!(0.10))),
        m if m.starts_with("llama-3.3-70b") => Some((dec!(0.85), dec!(1.20))),
        m if m.starts_with("claude-sonnet-4") => Some((dec!(3.00), dec!(15.00))),
        m if m.starts_with("claude-3-5-haiku") => Some((dec!(0.80), dec!(4.00))),
        m if m.starts_with("gpt-4o-mini") => Some((dec!(0.15), dec!(0.60))),
        m if m.starts_with("gpt-4o") => Some((dec!(2.50), dec!(10.00))),
        m if m.starts_with("z-ai/glm-4.5-air") => Some((dec!(0.20), dec!(1.10))),
        _ => None,
    };
    match per_million {
        Some((input, output)) => (input / dec!(1000000), output / dec!(1000000)),
        None => (Decimal::ZERO, Decimal::ZERO),
    }
}

/// Estimated USD cost of one call.
pub fn estimate(cost_per_token: (Decimal, Decimal), input_tokens: u32, output_tokens: u32) -> Decimal {
    let (input, output) = cost_per_token;
    input * Decimal::from(input_tokens) + output * Decimal::from(output_tokens)
}
