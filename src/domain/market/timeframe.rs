use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of candle bucket durations supported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1min")]
    OneMin,
    #[serde(rename = "10min")]
    TenMin,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1m")]
    OneMonth,
}

impl Timeframe {
    /// Returns the duration of this timeframe in minutes.
    ///
    /// A month is the 31-day upper bound; it is only used for poll-interval
    /// derivation, never for candle alignment.
    pub fn to_minutes(&self) -> i64 {
        match self {
            Timeframe::OneMin => 1,
            Timeframe::TenMin => 10,
            Timeframe::OneHour => 60,
            Timeframe::OneDay => 1440,
            Timeframe::OneWeek => 10_080,
            Timeframe::OneMonth => 44_640,
        }
    }

    /// Returns the duration in seconds.
    pub fn to_seconds(&self) -> i64 {
        self.to_minutes() * 60
    }

    /// Converts to the MOEX ISS `interval` query value.
    pub fn to_moex_interval(&self) -> u32 {
        match self {
            Timeframe::OneMin => 1,
            Timeframe::TenMin => 10,
            Timeframe::OneHour => 60,
            Timeframe::OneDay => 24,
            Timeframe::OneWeek => 7,
            Timeframe::OneMonth => 31,
        }
    }

    /// Canonical string form used in topic keys, cache keys and storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMin => "1min",
            Timeframe::TenMin => "10min",
            Timeframe::OneHour => "1h",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1w",
            Timeframe::OneMonth => "1m",
        }
    }

    /// Returns all timeframes in ascending duration order.
    pub fn all() -> Vec<Timeframe> {
        vec![
            Timeframe::OneMin,
            Timeframe::TenMin,
            Timeframe::OneHour,
            Timeframe::OneDay,
            Timeframe::OneWeek,
            Timeframe::OneMonth,
        ]
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1min" => Ok(Timeframe::OneMin),
            "10min" => Ok(Timeframe::TenMin),
            "1h" => Ok(Timeframe::OneHour),
            "1d" => Ok(Timeframe::OneDay),
            "1w" => Ok(Timeframe::OneWeek),
            "1m" => Ok(Timeframe::OneMonth),
            _ => Err(anyhow!(
                "Invalid timeframe: {}. Must be one of 1min, 10min, 1h, 1d, 1w, 1m",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_str() {
        for tf in Timeframe::all() {
            assert_eq!(tf.as_str().parse::<Timeframe>().unwrap(), tf);
        }
    }

    #[test]
    fn test_moex_interval_mapping() {
        assert_eq!(Timeframe::OneMin.to_moex_interval(), 1);
        assert_eq!(Timeframe::OneHour.to_moex_interval(), 60);
        assert_eq!(Timeframe::OneDay.to_moex_interval(), 24);
        assert_eq!(Timeframe::OneWeek.to_moex_interval(), 7);
        assert_eq!(Timeframe::OneMonth.to_moex_interval(), 31);
    }

    #[test]
    fn test_serde_uses_canonical_names() {
        let tf: Timeframe = serde_json::from_str("\"1h\"").unwrap();
        assert_eq!(tf, Timeframe::OneHour);
        assert_eq!(serde_json::to_string(&Timeframe::TenMin).unwrap(), "\"10min\"");
    }

    #[test]
    fn test_rejects_unknown() {
        assert!("4h".parse::<Timeframe>().is_err());
    }
}
