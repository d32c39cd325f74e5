//! Monte Carlo retirement simulation: year-by-year asset paths over many
//! independent trials, aggregated into success rates, percentile bands and a
//! bankruptcy timeline, plus sensitivity sweeps over key inputs.

pub mod api;
pub mod core;
