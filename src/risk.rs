// =============================================================================
// Risk metrics — pure enrichment of emitted trade records
// =============================================================================
//
// Uses the flat forex approximation risk = pips × volume × 10 with a pip of
// 0.0001 (0.01 for JPY pairs). Metals, indices, and crypto symbols will
// mis-compute under this model; the fields are advisory. Missing inputs
// leave the corresponding fields unset, never fail the record.
// =============================================================================

use crate::types::TradeRecord;

/// Pip size convention: JPY-quoted pairs use 0.01, everything else 0.0001.
pub fn pip_size(symbol: &str) -> f64 {
    if symbol.contains("JPY") {
        0.01
    } else {
        0.0001
    }
}

/// Fill in `risk_amount`, `r_multiple`, and `risk_reward` where the inputs
/// allow. Requires entry price, volume, and a non-zero stop loss.
pub fn enrich_with_risk_metrics(record: &mut TradeRecord) {
    let Some(stop_loss) = record.stop_loss.filter(|sl| *sl != 0.0) else {
        return;
    };
    if record.entry_price == 0.0 || record.volume == 0.0 {
        return;
    }

    let pip = pip_size(&record.symbol);
    let pips_risked = (record.entry_price - stop_loss).abs() / pip;
    let risk_amount = pips_risked * record.volume * 10.0;
    record.risk_amount = Some(risk_amount);

    if risk_amount > 0.0 {
        record.r_multiple = Some(record.gross_pnl / risk_amount);

        if let Some(take_profit) = record.take_profit.filter(|tp| *tp > 0.0) {
            let pips_to_target = (take_profit - record.entry_price).abs() / pip;
            record.risk_reward = Some(pips_to_target / pips_risked);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
