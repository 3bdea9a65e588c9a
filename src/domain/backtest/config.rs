use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Simulation timeout checked inside the candle loop.
pub const SIMULATION_TIMEOUT_SECS: u64 = 300;
/// The timeout is only polled every this many candles.
pub const TIMEOUT_CHECK_INTERVAL: usize = 1_000;
/// Progress is logged every 10% of processed candles.
pub const PROGRESS_LOG_INTERVAL: f64 = 0.1;

/// User-tunable simulation parameters, stored as JSONB on the job row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_balance: f64,
    /// Commission per leg as a fraction of position cost (0.03% = 0.0003).
    pub commission_rate: f64,
    /// Leverage on deployed capital (1.0 = 100%, 3.0 = 300%).
    pub position_size_multiplier: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_balance: 100_000.0,
            commission_rate: 0.0003,
            position_size_multiplier: 3.0,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.initial_balance > 0.0) {
            bail!("initial_balance must be positive, got {}", self.initial_balance);
        }
        if self.initial_balance < 1_000.0 {
            bail!("initial_balance below the 1,000 minimum: {}", self.initial_balance);
        }
        if self.initial_balance > 1_000_000_000.0 {
            bail!("initial_balance above the 1e9 maximum: {}", self.initial_balance);
        }
        if !(0.0..=0.01).contains(&self.commission_rate) {
            bail!(
                "commission_rate must be within [0, 0.01], got {}",
                self.commission_rate
            );
        }
        if !(self.position_size_multiplier > 0.0 && self.position_size_multiplier <= 10.0) {
            bail!(
                "position_size_multiplier must be within (0, 10], got {}",
                self.position_size_multiplier
            );
        }
        Ok(())
    }

    /// Builds a config from the job's `simulation_params` JSON.
    ///
    /// Accepts the legacy percentage aliases (`commission_pct`,
    /// `position_size_pct`) still present on old job rows.
    pub fn from_simulation_params(params: &Value) -> Result<BacktestConfig> {
        let defaults = BacktestConfig::default();

        let commission_rate = match params.get("commission_rate").and_then(Value::as_f64) {
            Some(rate) => rate,
            None => match params.get("commission_pct").and_then(Value::as_f64) {
                Some(pct) => pct / 100.0,
                None => defaults.commission_rate,
            },
        };

        let position_size_multiplier = match params
            .get("position_size_multiplier")
            .and_then(Value::as_f64)
        {
            Some(mult) => mult,
            None => match params.get("position_size_pct").and_then(Value::as_f64) {
                Some(pct) => pct / 100.0,
                None => defaults.position_size_multiplier,
            },
        };

        let config = BacktestConfig {
            initial_balance: params
                .get("initial_balance")
                .and_then(Value::as_f64)
                .unwrap_or(defaults.initial_balance),
            commission_rate,
            position_size_multiplier,
        };
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_are_valid() {
        assert!(BacktestConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_params_new_format() {
        let config = BacktestConfig::from_simulation_params(&json!({
            "initial_balance": 50_000.0,
            "commission_rate": 0.0004,
            "position_size_multiplier": 2.0
        }))
        .unwrap();
        assert_eq!(config.initial_balance, 50_000.0);
        assert_eq!(config.commission_rate, 0.0004);
        assert_eq!(config.position_size_multiplier, 2.0);
    }

    #[test]
    fn test_from_params_legacy_percentages() {
        let config = BacktestConfig::from_simulation_params(&json!({
            "commission_pct": 0.04,
            "position_size_pct": 300.0
        }))
        .unwrap();
        assert!((config.commission_rate - 0.0004).abs() < 1e-12);
        assert_eq!(config.position_size_multiplier, 3.0);
    }

    #[test]
    fn test_out_of_range_rejected() {
        assert!(
            BacktestConfig::from_simulation_params(&json!({"commission_rate": 0.02})).is_err()
        );
        assert!(
            BacktestConfig::from_simulation_params(&json!({"position_size_multiplier": 11.0}))
                .is_err()
        );
        assert!(
            BacktestConfig::from_simulation_params(&json!({"initial_balance": 100.0})).is_err()
        );
    }
}
