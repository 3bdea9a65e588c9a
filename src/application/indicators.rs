//! Online indicator computation.
//!
//! The `ta` crate supplies the smoothing primitives; this module only maps
//! canonical indicator definitions onto them and keeps the talib-style
//! warm-up convention (NaN until enough candles have been seen). SuperTrend
//! is assembled from ATR since it has no upstream primitive.

use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;
use ta::indicators::{
    AverageTrueRange, BollingerBands, ExponentialMovingAverage, MoneyFlowIndex,
    MovingAverageConvergenceDivergence, RelativeStrengthIndex, SimpleMovingAverage,
    SlowStochastic,
};
use ta::{DataItem, Next};

use crate::application::frame::CandleFrame;
use crate::domain::strategy::indicator_key::IndicatorDef;

/// Computes a fixed set of indicator series over rolling candle context.
#[derive(Debug, Clone)]
pub struct IndicatorPipeline {
    defs: Vec<IndicatorDef>,
}

impl IndicatorPipeline {
    /// Validates that every definition belongs to a supported family.
    pub fn new(defs: Vec<IndicatorDef>) -> Result<IndicatorPipeline> {
        for def in &defs {
            match def.name.as_str() {
                "ema" | "sma" | "rsi" | "atr" | "mfi" | "stoch" | "macd" | "bbands"
                | "supertrend" => {}
                other => bail!(
                    "Unsupported indicator family '{other}' (supported: ema, sma, rsi, atr, mfi, stoch, macd, bbands, supertrend)"
                ),
            }
        }
        Ok(IndicatorPipeline { defs })
    }

    pub fn defs(&self) -> &[IndicatorDef] {
        &self.defs
    }

    pub fn output_keys(&self) -> Vec<String> {
        self.defs.iter().map(IndicatorDef::canonical_key).collect()
    }

    /// Every configured series over the frame, keyed by canonical key.
    pub fn compute_all(&self, frame: &CandleFrame) -> Result<BTreeMap<String, Vec<f64>>> {
        let mut out = BTreeMap::new();
        for def in &self.defs {
            out.insert(def.canonical_key(), compute_series(def, frame)?);
        }
        Ok(out)
    }

    /// Values at the last candle only, the shape the RT path persists.
    pub fn compute_latest(&self, frame: &CandleFrame) -> Result<BTreeMap<String, Option<f64>>> {
        let all = self.compute_all(frame)?;
        Ok(all
            .into_iter()
            .map(|(key, series)| {
                let last = series.last().copied().filter(|v| !v.is_nan());
                (key, last)
            })
            .collect())
    }
}

fn param(def: &IndicatorDef, name: &str, default: f64) -> f64 {
    def.params
        .get(name)
        .and_then(|p| p.as_f64())
        .unwrap_or(default)
}

fn compute_series(def: &IndicatorDef, frame: &CandleFrame) -> Result<Vec<f64>> {
    let n = frame.len();
    let close = &frame.close;

    let series = match def.name.as_str() {
        "ema" => {
            let period = param(def, "timeperiod", 20.0) as usize;
            let mut ema = ExponentialMovingAverage::new(period)
                .map_err(|e| anyhow!("bad ema period: {e}"))?;
            warmup_masked(close.iter().map(|&c| ema.next(c)).collect(), period - 1)
        }
        "sma" => {
            let period = param(def, "timeperiod", 20.0) as usize;
            let mut sma =
                SimpleMovingAverage::new(period).map_err(|e| anyhow!("bad sma period: {e}"))?;
            warmup_masked(close.iter().map(|&c| sma.next(c)).collect(), period - 1)
        }
        "rsi" => {
            let period = param(def, "timeperiod", 14.0) as usize;
            let mut rsi = RelativeStrengthIndex::new(period)
                .map_err(|e| anyhow!("bad rsi period: {e}"))?;
            warmup_masked(close.iter().map(|&c| rsi.next(c)).collect(), period)
        }
        "atr" => {
            let period = param(def, "timeperiod", 14.0) as usize;
            let mut atr =
                AverageTrueRange::new(period).map_err(|e| anyhow!("bad atr period: {e}"))?;
            let mut series = Vec::with_capacity(n);
            for i in 0..n {
                series.push(atr.next(&data_item(frame, i)?));
            }
            warmup_masked(series, period)
        }
        "mfi" => {
            let period = param(def, "timeperiod", 14.0) as usize;
            let mut mfi =
                MoneyFlowIndex::new(period).map_err(|e| anyhow!("bad mfi period: {e}"))?;
            let mut series = Vec::with_capacity(n);
            for i in 0..n {
                series.push(mfi.next(&data_item(frame, i)?));
            }
            warmup_masked(series, period)
        }
        "stoch" => {
            let fastk = param(def, "fastk", 14.0) as usize;
            let slowk = param(def, "slowk", 3.0) as usize;
            let slowd = param(def, "slowd", 3.0) as usize;
            if !["slowk", "slowd"].contains(&def.output.as_str()) {
                bail!("Unknown stoch output '{}'", def.output);
            }
            let mut k_line = SlowStochastic::new(fastk, slowk)
                .map_err(|e| anyhow!("bad stoch periods: {e}"))?;
            let mut k_series = Vec::with_capacity(n);
            for i in 0..n {
                k_series.push(k_line.next(&data_item(frame, i)?));
            }
            if def.output == "slowk" {
                warmup_masked(k_series, fastk + slowk)
            } else {
                // %D is the smoothed %K line.
                let mut d_smoother = ExponentialMovingAverage::new(slowd)
                    .map_err(|e| anyhow!("bad stoch slowd period: {e}"))?;
                let d_series = k_series.into_iter().map(|k| d_smoother.next(k)).collect();
                warmup_masked(d_series, fastk + slowk + slowd)
            }
        }
        "macd" => {
            let fast = param(def, "fastperiod", 12.0) as usize;
            let slow = param(def, "slowperiod", 26.0) as usize;
            let signal = param(def, "signalperiod", 9.0) as usize;
            if !["macd", "signal", "histogram"].contains(&def.output.as_str()) {
                bail!("Unknown macd output '{}'", def.output);
            }
            let mut macd = MovingAverageConvergenceDivergence::new(fast, slow, signal)
                .map_err(|e| anyhow!("bad macd periods: {e}"))?;
            let picked = close
                .iter()
                .map(|&c| {
                    let o = macd.next(c);
                    match def.output.as_str() {
                        "macd" => o.macd,
                        "signal" => o.signal,
                        _ => o.histogram,
                    }
                })
                .collect();
            warmup_masked(picked, slow + signal - 2)
        }
        "bbands" => {
            let period = param(def, "timeperiod", 20.0) as usize;
            let multiplier = param(def, "nbdev", 2.0);
            if !["upper", "middle", "lower"].contains(&def.output.as_str()) {
                bail!("Unknown bbands output '{}'", def.output);
            }
            let mut bands = BollingerBands::new(period, multiplier)
                .map_err(|e| anyhow!("bad bbands config: {e}"))?;
            let picked = close
                .iter()
                .map(|&c| {
                    let o = bands.next(c);
                    match def.output.as_str() {
                        "upper" => o.upper,
                        "middle" => o.average,
                        _ => o.lower,
                    }
                })
                .collect();
            warmup_masked(picked, period - 1)
        }
        "supertrend" => {
            let length = param(def, "length", 10.0) as usize;
            let multiplier = param(def, "multiplier", 3.0);
            let (value, direction) = supertrend(frame, length, multiplier)?;
            match def.output.as_str() {
                "value" => value,
                "direction" => direction,
                other => bail!("Unknown supertrend output '{other}'"),
            }
        }
        other => bail!("Unsupported indicator family '{other}'"),
    };

    Ok(series)
}

fn data_item(frame: &CandleFrame, i: usize) -> Result<DataItem> {
    DataItem::builder()
        .open(frame.open[i])
        .high(frame.high[i])
        .low(frame.low[i])
        .close(frame.close[i])
        .volume(frame.volume[i])
        .build()
        .map_err(|e| anyhow!("bad candle at index {i}: {e}"))
}

/// Masks the first `warmup` values with NaN, matching the talib convention
/// the analytical store was populated with.
fn warmup_masked(mut series: Vec<f64>, warmup: usize) -> Vec<f64> {
    let cut = warmup.min(series.len());
    for value in &mut series[..cut] {
        *value = f64::NAN;
    }
    series
}

/// SuperTrend over ATR with the usual band ratchet. Direction is +1 while
/// price rides the lower band, -1 on the upper band.
fn supertrend(frame: &CandleFrame, length: usize, multiplier: f64) -> Result<(Vec<f64>, Vec<f64>)> {
    let n = frame.len();
    let mut atr =
        AverageTrueRange::new(length).map_err(|e| anyhow!("bad supertrend length: {e}"))?;

    let mut value = vec![f64::NAN; n];
    let mut direction = vec![f64::NAN; n];
    let mut upper_band = f64::NAN;
    let mut lower_band = f64::NAN;
    let mut dir = 1.0;

    for i in 0..n {
        let range = atr.next(&data_item(frame, i)?);
        if i < length {
            continue;
        }

        let mid = (frame.high[i] + frame.low[i]) / 2.0;
        let raw_upper = mid + multiplier * range;
        let raw_lower = mid - multiplier * range;

        // Bands only tighten while price stays on their side.
        if upper_band.is_nan() || raw_upper < upper_band || frame.close[i - 1] > upper_band {
            upper_band = raw_upper;
        }
        if lower_band.is_nan() || raw_lower > lower_band || frame.close[i - 1] < lower_band {
            lower_band = raw_lower;
        }

        if frame.close[i] > upper_band {
            dir = 1.0;
        } else if frame.close[i] < lower_band {
            dir = -1.0;
        }

        direction[i] = dir;
        value[i] = if dir > 0.0 { lower_band } else { upper_band };
    }

    Ok((value, direction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Candle, Timeframe};
    use chrono::{TimeZone, Utc};

    fn frame(closes: &[f64]) -> CandleFrame {
        let candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, &close)| Candle {
                ticker: "SBER".to_string(),
                timeframe: Timeframe::OneHour,
                begin: Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap()
                    + chrono::Duration::hours(i as i64),
                open: close,
                high: close * 1.01,
                low: close * 0.99,
                close,
                volume: 100.0,
                value: None,
            })
            .collect();
        CandleFrame::from_candles(&candles)
    }

    fn def(key: &str) -> IndicatorDef {
        IndicatorDef::parse(key).unwrap().unwrap()
    }

    #[test]
    fn test_unsupported_family_rejected() {
        assert!(IndicatorPipeline::new(vec![def("ichimoku_senkou_52_value")]).is_err());
        assert!(IndicatorPipeline::new(vec![def("ema_timeperiod_12_value")]).is_ok());
        assert!(IndicatorPipeline::new(vec![def("mfi_timeperiod_14_value")]).is_ok());
        assert!(
            IndicatorPipeline::new(vec![def("stoch_fastk_14_slowd_3_slowk_3_slowk")]).is_ok()
        );
    }

    #[test]
    fn test_mfi_warmup_and_range() {
        let pipeline = IndicatorPipeline::new(vec![def("mfi_timeperiod_3_value")]).unwrap();
        let frame = frame(&[10.0, 11.0, 10.5, 12.0, 11.5, 13.0]);
        let all = pipeline.compute_all(&frame).unwrap();
        let series = &all["mfi_timeperiod_3_value"];

        assert!(series[0].is_nan());
        assert!(series[2].is_nan());
        // MFI is an oscillator bounded by [0, 100].
        for value in series.iter().filter(|v| !v.is_nan()) {
            assert!((0.0..=100.0).contains(value));
        }
    }

    #[test]
    fn test_stoch_outputs() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + (i % 5) as f64).collect();
        let frame = frame(&closes);

        let pipeline = IndicatorPipeline::new(vec![
            def("stoch_fastk_5_slowd_3_slowk_3_slowk"),
            def("stoch_fastk_5_slowd_3_slowk_3_slowd"),
        ])
        .unwrap();
        let all = pipeline.compute_all(&frame).unwrap();

        let slowk = &all["stoch_fastk_5_slowd_3_slowk_3_slowk"];
        let slowd = &all["stoch_fastk_5_slowd_3_slowk_3_slowd"];
        // %K warms up after fastk + slowk candles, %D after slowd more.
        assert!(slowk[7].is_nan());
        assert!(!slowk[8].is_nan());
        assert!(slowd[10].is_nan());
        assert!(!slowd[11].is_nan());

        let bad = IndicatorPipeline::new(vec![def("stoch_fastk_5_slowd_3_slowk_3_value")])
            .unwrap();
        assert!(bad.compute_all(&frame).is_err());
    }

    #[test]
    fn test_ema_warmup_and_values() {
        let pipeline = IndicatorPipeline::new(vec![def("ema_timeperiod_3_value")]).unwrap();
        let frame = frame(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        let all = pipeline.compute_all(&frame).unwrap();
        let series = &all["ema_timeperiod_3_value"];

        assert!(series[0].is_nan());
        assert!(series[1].is_nan());
        assert!(!series[2].is_nan());
        // EMA trails a rising close from below.
        assert!(series[4] < 14.0 && series[4] > 12.0);
    }

    #[test]
    fn test_compute_latest_shapes_rt_row() {
        let pipeline = IndicatorPipeline::new(vec![
            def("ema_timeperiod_3_value"),
            def("rsi_timeperiod_14_value"),
        ])
        .unwrap();
        // Too short for RSI(14) but enough for EMA(3).
        let frame = frame(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        let latest = pipeline.compute_latest(&frame).unwrap();

        assert!(latest["ema_timeperiod_3_value"].is_some());
        assert_eq!(latest["rsi_timeperiod_14_value"], None);
    }

    #[test]
    fn test_supertrend_direction_follows_trend() {
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        closes.extend((0..30).map(|i| 130.0 - 3.0 * i as f64));
        let frame = frame(&closes);

        let (_, direction) = supertrend(&frame, 5, 1.0).unwrap();
        // Solidly rising early on, solidly falling at the end.
        assert_eq!(direction[25], 1.0);
        assert_eq!(direction[59], -1.0);
    }

    #[test]
    fn test_macd_output_selection() {
        let pipeline = IndicatorPipeline::new(vec![def(
            "macd_fastperiod_3_signalperiod_2_slowperiod_5_macd",
        )])
        .unwrap();
        let frame = frame(&(0..20).map(|i| 100.0 + i as f64).collect::<Vec<_>>());
        let all = pipeline.compute_all(&frame).unwrap();
        let series = &all["macd_fastperiod_3_signalperiod_2_slowperiod_5_macd"];
        assert!(series[0].is_nan());
        // A steady uptrend keeps the fast EMA above the slow one.
        assert!(series[19] > 0.0);
    }
}
