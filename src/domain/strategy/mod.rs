// Strategy AST and indicator key grammar
pub mod ast;
pub mod indicator_key;

pub use ast::{
    ConditionNode, StopLossConfig, StrategyDefinition, TakeProfitConfig, TargetDirection,
    ValueNode,
};
pub use indicator_key::{IndicatorDef, ParamValue};
