//! Strategy definition AST.
//!
//! The `definition` JSONB column of `strategies` deserializes into this tree.
//! Node kinds are discriminated by a `type` tag; conditions recurse through
//! AND/OR containers with boxed child lists.

use serde::{Deserialize, Serialize};

use crate::domain::errors::StrategyError;

/// Per-candle scalar producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ValueNode {
    /// Constant number.
    #[serde(rename = "VALUE")]
    Value { value: f64 },

    /// Indicator (or OHLCV column) lookup on the current candle.
    #[serde(rename = "INDICATOR_VALUE")]
    Indicator { key: String },

    /// Indicator (or OHLCV column) lookup on the previous candle.
    #[serde(rename = "PREV_INDICATOR_VALUE")]
    PrevIndicator { key: String },
}

/// Direction selector for position-aware flip nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetDirection {
    #[serde(rename = "OPPOSITE_TO_POSITION")]
    OppositeToPosition,
}

/// Per-candle boolean producers, including logical containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConditionNode {
    #[serde(rename = "GREATER_THAN")]
    GreaterThan { left: ValueNode, right: ValueNode },

    #[serde(rename = "LESS_THAN")]
    LessThan { left: ValueNode, right: ValueNode },

    #[serde(rename = "EQUALS")]
    Equals { left: ValueNode, right: ValueNode },

    /// True when `line1` closes above `line2` after being at or below it on
    /// the previous candle.
    #[serde(rename = "CROSSOVER_UP")]
    CrossoverUp { line1: ValueNode, line2: ValueNode },

    #[serde(rename = "CROSSOVER_DOWN")]
    CrossoverDown { line1: ValueNode, line2: ValueNode },

    /// SuperTrend direction flip against the open position. Position-aware:
    /// only evaluated in the exit path, never as an entry predicate.
    #[serde(rename = "SUPER_TREND_FLIP")]
    SuperTrendFlip {
        indicator_key: String,
        target_direction: TargetDirection,
    },

    /// MACD line crossing its signal line against the open position. Same
    /// exit-path-only asymmetry as `SUPER_TREND_FLIP`.
    #[serde(rename = "MACD_CROSSOVER_FLIP")]
    MacdCrossoverFlip {
        indicator_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal_key: Option<String>,
        target_direction: TargetDirection,
    },

    #[serde(rename = "AND")]
    And { conditions: Vec<ConditionNode> },

    #[serde(rename = "OR")]
    Or { conditions: Vec<ConditionNode> },
}

/// Stop-loss configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StopLossConfig {
    /// Stop level read from an indicator column per position side.
    #[serde(rename = "INDICATOR_BASED")]
    IndicatorBased {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        buy_value_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sell_value_key: Option<String>,
    },

    /// Fixed percentage from the close, which trails the price.
    #[serde(rename = "PERCENTAGE")]
    Percentage { percentage: f64 },
}

/// Take-profit configuration block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TakeProfitConfig {
    #[serde(rename = "PERCENTAGE")]
    Percentage { percentage: f64 },

    /// Target placed at `risk * ratio` beyond the entry; requires a stop.
    #[serde(rename = "RISK_REWARD")]
    RiskReward { risk_reward_ratio: f64 },
}

/// Complete strategy definition as stored in `strategies.definition` and
/// snapshotted onto each backtest job at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_buy_conditions: Option<ConditionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_sell_conditions: Option<ConditionNode>,
    /// Shared exit conditions applied to either side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_conditions: Option<ConditionNode>,
    /// Per-side exit overrides; take precedence over `exit_conditions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_long_conditions: Option<ConditionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_short_conditions: Option<ConditionNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<StopLossConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<TakeProfitConfig>,
}

impl StrategyDefinition {
    /// Static validation: at least one entry branch, percentage ranges, and
    /// no position-aware node inside an entry tree.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.entry_buy_conditions.is_none() && self.entry_sell_conditions.is_none() {
            return Err(StrategyError::MissingEntryConditions);
        }

        for entry in [&self.entry_buy_conditions, &self.entry_sell_conditions]
            .into_iter()
            .flatten()
        {
            reject_flip_nodes(entry)?;
        }

        if let Some(StopLossConfig::Percentage { percentage }) = &self.stop_loss {
            if !(*percentage > 0.0 && *percentage <= 50.0) {
                return Err(StrategyError::InvalidStopLossPercentage(*percentage));
            }
            if *percentage > 10.0 {
                tracing::warn!(
                    "Stop loss of {percentage}% is very wide; 1-5% is the usual range"
                );
            }
        }

        match &self.take_profit {
            Some(TakeProfitConfig::Percentage { percentage }) => {
                if !(*percentage > 0.0 && *percentage <= 100.0) {
                    return Err(StrategyError::InvalidTakeProfitPercentage(*percentage));
                }
            }
            Some(TakeProfitConfig::RiskReward { risk_reward_ratio }) => {
                if !(*risk_reward_ratio > 0.0) {
                    return Err(StrategyError::InvalidRiskRewardRatio(*risk_reward_ratio));
                }
                if *risk_reward_ratio < 0.5 {
                    tracing::warn!(
                        "Risk/reward ratio {risk_reward_ratio} below 0.5 needs a win rate above 50% to break even"
                    );
                }
            }
            None => {}
        }

        Ok(())
    }

    /// Exit tree for a long position: the per-side override when present,
    /// otherwise the shared exit tree.
    pub fn exit_tree_long(&self) -> Option<&ConditionNode> {
        self.exit_long_conditions
            .as_ref()
            .or(self.exit_conditions.as_ref())
    }

    /// Exit tree for a short position.
    pub fn exit_tree_short(&self) -> Option<&ConditionNode> {
        self.exit_short_conditions
            .as_ref()
            .or(self.exit_conditions.as_ref())
    }
}

fn reject_flip_nodes(node: &ConditionNode) -> Result<(), StrategyError> {
    match node {
        ConditionNode::SuperTrendFlip { .. } => {
            Err(StrategyError::FlipNodeInEntry("SUPER_TREND_FLIP"))
        }
        ConditionNode::MacdCrossoverFlip { .. } => {
            Err(StrategyError::FlipNodeInEntry("MACD_CROSSOVER_FLIP"))
        }
        ConditionNode::And { conditions } | ConditionNode::Or { conditions } => {
            for child in conditions {
                reject_flip_nodes(child)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crossover_entry() -> ConditionNode {
        ConditionNode::CrossoverUp {
            line1: ValueNode::Indicator {
                key: "ema_timeperiod_12_value".to_string(),
            },
            line2: ValueNode::Indicator {
                key: "ema_timeperiod_50_value".to_string(),
            },
        }
    }

    #[test]
    fn test_deserialize_tagged_tree() {
        let json = r#"{
            "entry_buy_conditions": {
                "type": "AND",
                "conditions": [
                    {
                        "type": "GREATER_THAN",
                        "left": {"type": "INDICATOR_VALUE", "key": "rsi_timeperiod_14_value"},
                        "right": {"type": "VALUE", "value": 70.0}
                    },
                    {
                        "type": "CROSSOVER_UP",
                        "line1": {"type": "INDICATOR_VALUE", "key": "ema_timeperiod_12_value"},
                        "line2": {"type": "INDICATOR_VALUE", "key": "ema_timeperiod_50_value"}
                    }
                ]
            },
            "stop_loss": {"type": "PERCENTAGE", "percentage": 5.0},
            "take_profit": {"type": "RISK_REWARD", "risk_reward_ratio": 2.0}
        }"#;

        let def: StrategyDefinition = serde_json::from_str(json).unwrap();
        assert!(def.validate().is_ok());
        match def.entry_buy_conditions.unwrap() {
            ConditionNode::And { conditions } => assert_eq!(conditions.len(), 2),
            other => panic!("expected AND, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_entries_rejected() {
        let def = StrategyDefinition {
            exit_conditions: Some(crossover_entry()),
            ..Default::default()
        };
        assert_eq!(def.validate(), Err(StrategyError::MissingEntryConditions));
    }

    #[test]
    fn test_flip_node_in_entry_rejected() {
        let def = StrategyDefinition {
            entry_buy_conditions: Some(ConditionNode::SuperTrendFlip {
                indicator_key: "supertrend_length_10_direction".to_string(),
                target_direction: TargetDirection::OppositeToPosition,
            }),
            ..Default::default()
        };
        assert_eq!(
            def.validate(),
            Err(StrategyError::FlipNodeInEntry("SUPER_TREND_FLIP"))
        );
    }

    #[test]
    fn test_stop_loss_percentage_bounds() {
        let def = StrategyDefinition {
            entry_buy_conditions: Some(crossover_entry()),
            stop_loss: Some(StopLossConfig::Percentage { percentage: 55.0 }),
            ..Default::default()
        };
        assert_eq!(
            def.validate(),
            Err(StrategyError::InvalidStopLossPercentage(55.0))
        );
    }

    #[test]
    fn test_exit_tree_side_overrides() {
        let shared = crossover_entry();
        let def = StrategyDefinition {
            entry_buy_conditions: Some(crossover_entry()),
            exit_conditions: Some(shared.clone()),
            exit_short_conditions: Some(ConditionNode::LessThan {
                left: ValueNode::Indicator {
                    key: "close".to_string(),
                },
                right: ValueNode::Value { value: 10.0 },
            }),
            ..Default::default()
        };
        assert_eq!(def.exit_tree_long(), Some(&shared));
        assert_ne!(def.exit_tree_short(), Some(&shared));
    }
}
