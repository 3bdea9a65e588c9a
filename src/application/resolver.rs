//! Indicator dependency resolver.
//!
//! Walks a strategy AST, collects every indicator key it references, parses
//! each back into `(name, params, output)` and derives the warm-up window
//! the strategy needs before its start date.

use std::collections::BTreeSet;

use crate::domain::errors::StrategyError;
use crate::domain::strategy::ast::{ConditionNode, StopLossConfig, StrategyDefinition, ValueNode};
use crate::domain::strategy::indicator_key::IndicatorDef;

/// Indicator requirements of one strategy definition.
#[derive(Debug, Clone)]
pub struct ResolvedIndicators {
    /// Parsed definitions, deduplicated, in stable key order.
    pub defs: Vec<IndicatorDef>,
    /// Maximum warm-up candle count across all referenced indicators.
    pub max_lookback: usize,
}

impl ResolvedIndicators {
    pub fn keys(&self) -> Vec<String> {
        self.defs.iter().map(IndicatorDef::canonical_key).collect()
    }
}

/// Collects and parses every indicator the definition references. OHLCV
/// column references are not indicators and are skipped; malformed keys are
/// a validation error.
pub fn resolve_indicators(
    definition: &StrategyDefinition,
) -> Result<ResolvedIndicators, StrategyError> {
    let mut keys = BTreeSet::new();

    for tree in [
        &definition.entry_buy_conditions,
        &definition.entry_sell_conditions,
        &definition.exit_conditions,
        &definition.exit_long_conditions,
        &definition.exit_short_conditions,
    ]
    .into_iter()
    .flatten()
    {
        collect_condition_keys(tree, &mut keys);
    }

    match &definition.stop_loss {
        Some(StopLossConfig::IndicatorBased {
            buy_value_key,
            sell_value_key,
        }) => {
            if let Some(key) = buy_value_key {
                keys.insert(key.clone());
            }
            if let Some(key) = sell_value_key {
                keys.insert(key.clone());
            }
        }
        Some(StopLossConfig::Percentage { .. }) | None => {}
    }

    let mut defs = Vec::new();
    for key in keys {
        if let Some(def) = IndicatorDef::parse(&key)? {
            defs.push(def);
        }
    }

    let max_lookback = defs.iter().map(IndicatorDef::lookback).max().unwrap_or(0);

    Ok(ResolvedIndicators { defs, max_lookback })
}

fn collect_condition_keys(node: &ConditionNode, keys: &mut BTreeSet<String>) {
    match node {
        ConditionNode::GreaterThan { left, right }
        | ConditionNode::LessThan { left, right }
        | ConditionNode::Equals { left, right } => {
            collect_value_key(left, keys);
            collect_value_key(right, keys);
        }
        ConditionNode::CrossoverUp { line1, line2 }
        | ConditionNode::CrossoverDown { line1, line2 } => {
            collect_value_key(line1, keys);
            collect_value_key(line2, keys);
        }
        ConditionNode::SuperTrendFlip { indicator_key, .. } => {
            keys.insert(indicator_key.clone());
        }
        ConditionNode::MacdCrossoverFlip {
            indicator_key,
            signal_key,
            ..
        } => {
            keys.insert(indicator_key.clone());
            if let Some(signal) = signal_key {
                keys.insert(signal.clone());
            }
        }
        ConditionNode::And { conditions } | ConditionNode::Or { conditions } => {
            for child in conditions {
                collect_condition_keys(child, keys);
            }
        }
    }
}

fn collect_value_key(node: &ValueNode, keys: &mut BTreeSet<String>) {
    match node {
        ValueNode::Value { .. } => {}
        ValueNode::Indicator { key } | ValueNode::PrevIndicator { key } => {
            keys.insert(key.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::strategy::ast::TargetDirection;

    fn indicator(key: &str) -> ValueNode {
        ValueNode::Indicator { key: key.to_string() }
    }

    #[test]
    fn test_collects_across_all_trees() {
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::CrossoverUp {
                line1: indicator("ema_timeperiod_12_value"),
                line2: indicator("ema_timeperiod_50_value"),
            }),
            exit_conditions: Some(ConditionNode::SuperTrendFlip {
                indicator_key: "supertrend_length_10_multiplier_3.0_direction".to_string(),
                target_direction: TargetDirection::OppositeToPosition,
            }),
            stop_loss: Some(StopLossConfig::IndicatorBased {
                buy_value_key: Some("atr_timeperiod_14_value".to_string()),
                sell_value_key: None,
            }),
            ..Default::default()
        };

        let resolved = resolve_indicators(&def).unwrap();
        assert_eq!(
            resolved.keys(),
            vec![
                "atr_timeperiod_14_value",
                "ema_timeperiod_12_value",
                "ema_timeperiod_50_value",
                "supertrend_length_10_multiplier_3.0_direction",
            ]
        );
        // ema_50 dominates: 2 * 50.
        assert_eq!(resolved.max_lookback, 100);
    }

    #[test]
    fn test_ohlcv_references_are_not_requirements() {
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("close"),
                right: ValueNode::Value { value: 100.0 },
            }),
            ..Default::default()
        };
        let resolved = resolve_indicators(&def).unwrap();
        assert!(resolved.defs.is_empty());
        assert_eq!(resolved.max_lookback, 0);
    }

    #[test]
    fn test_duplicate_keys_deduplicated() {
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::And {
                conditions: vec![
                    ConditionNode::GreaterThan {
                        left: indicator("rsi_timeperiod_14_value"),
                        right: ValueNode::Value { value: 30.0 },
                    },
                    ConditionNode::LessThan {
                        left: indicator("rsi_timeperiod_14_value"),
                        right: ValueNode::Value { value: 70.0 },
                    },
                ],
            }),
            ..Default::default()
        };
        let resolved = resolve_indicators(&def).unwrap();
        assert_eq!(resolved.defs.len(), 1);
        assert_eq!(resolved.max_lookback, 28);
    }

    #[test]
    fn test_malformed_key_is_error() {
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::GreaterThan {
                left: indicator("ema"),
                right: ValueNode::Value { value: 1.0 },
            }),
            ..Default::default()
        };
        assert!(resolve_indicators(&def).is_err());
    }
}
