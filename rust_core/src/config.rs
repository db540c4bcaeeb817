use serde::{Deserialize, Serialize};

use crate::error::{NetworkError, Result};
use crate::layers::Activation;

/// Which encoder layout to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// LSTM then dense projection.
    #[default]
    Current,
    /// LSTM, GRU, then dense projection.
    Legacy,
}

/// Arguments for a dense layer, as carried in the construction mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseArgs {
    pub units: usize,
    /// `None` (or a missing key) means linear.
    #[serde(default)]
    pub activation: Option<Activation>,
    #[serde(default = "default_use_bias")]
    pub use_bias: bool,
}

fn default_use_bias() -> bool {
    true
}

impl DenseArgs {
    pub fn new(units: usize, activation: Activation) -> Self {
        Self {
            units,
            activation: Some(activation),
            use_bias: true,
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation.unwrap_or_default()
    }
}

/// Construction mapping for [`crate::network::PosteriorNetwork`].
///
/// Keys not listed here are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub embedding_lstm_units: usize,
    /// Only read by the legacy encoder.
    #[serde(default)]
    pub embedding_gru_units: Option<usize>,
    pub dense_pre_args: DenseArgs,
    pub dense_micro_args: DenseArgs,
    pub macro_lstm_units: usize,
    pub n_micro_params: usize,
    pub n_macro_params: usize,
}

impl Default for NetworkConfig {
    /// Drift as the only micro parameter; boundary and non-decision time as
    /// macro parameters.
    fn default() -> Self {
        Self {
            embedding_lstm_units: 64,
            embedding_gru_units: Some(64),
            dense_pre_args: DenseArgs::new(64, Activation::Relu),
            dense_micro_args: DenseArgs::new(64, Activation::Relu),
            macro_lstm_units: 32,
            n_micro_params: 1,
            n_macro_params: 2,
        }
    }
}

impl NetworkConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn validate(&self, variant: Variant) -> Result<()> {
        let widths = [
            ("embedding_lstm_units", self.embedding_lstm_units),
            ("dense_pre_args.units", self.dense_pre_args.units),
            ("dense_micro_args.units", self.dense_micro_args.units),
            ("macro_lstm_units", self.macro_lstm_units),
            ("n_micro_params", self.n_micro_params),
            ("n_macro_params", self.n_macro_params),
        ];
        for (key, value) in widths {
            if value == 0 {
                return Err(NetworkError::InvalidConfig(format!("{} must be positive", key)));
            }
        }
        if variant == Variant::Legacy {
            match self.embedding_gru_units {
                Some(0) => {
                    return Err(NetworkError::InvalidConfig(
                        "embedding_gru_units must be positive".to_string(),
                    ))
                }
                None => {
                    return Err(NetworkError::InvalidConfig(
                        "legacy encoder requires embedding_gru_units".to_string(),
                    ))
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const META: &str = r#"{
        "embedding_lstm_units": 16,
        "embedding_gru_units": 8,
        "dense_pre_args": {"units": 12, "activation": "tanh"},
        "dense_micro_args": {"units": 10, "activation": "relu", "use_bias": false},
        "macro_lstm_units": 6,
        "n_micro_params": 4,
        "n_macro_params": 3,
        "unused_key": [1, 2, 3]
    }"#;

    #[test]
    fn test_parse_mapping_ignores_unknown_keys() {
        let cfg = NetworkConfig::from_json_str(META).unwrap();
        assert_eq!(cfg.embedding_gru_units, Some(8));
        assert_eq!(cfg.dense_pre_args.activation(), Activation::Tanh);
        assert!(cfg.dense_pre_args.use_bias);
        assert!(!cfg.dense_micro_args.use_bias);
        assert_eq!(cfg.n_macro_params, 3);
        cfg.validate(Variant::Legacy).unwrap();
    }

    #[test]
    fn test_missing_activation_is_linear() {
        let value = serde_json::json!({"units": 3, "activation": null});
        let args: DenseArgs = serde_json::from_value(value).unwrap();
        assert_eq!(args.activation(), Activation::Linear);
    }

    #[test]
    fn test_missing_required_key_fails_to_parse() {
        let err = NetworkConfig::from_json_str(r#"{"embedding_lstm_units": 4}"#).unwrap_err();
        assert!(matches!(err, NetworkError::Json(_)));
    }

    #[test]
    fn test_legacy_requires_gru_units() {
        let cfg = NetworkConfig {
            embedding_gru_units: None,
            ..NetworkConfig::default()
        };
        cfg.validate(Variant::Current).unwrap();
        assert!(matches!(
            cfg.validate(Variant::Legacy),
            Err(NetworkError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_width_rejected() {
        let cfg = NetworkConfig {
            n_micro_params: 0,
            ..NetworkConfig::default()
        };
        assert!(cfg.validate(Variant::Current).is_err());
    }

    #[test]
    fn test_round_trip_through_value() {
        let cfg = NetworkConfig::default();
        let value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(NetworkConfig::from_json_value(value).unwrap(), cfg);
    }
}
