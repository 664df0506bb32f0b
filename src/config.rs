//! External engine configuration.
//!
//! `EngineConfig` is the post-parse shape consumed by the session
//! coordinator. Settings entries override the programmatic defaults of the
//! scenario they name; fields a settings entry does not supply keep their
//! programmatic values.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::scenario::Scenario;
use crate::timeline::LoadSimulation;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scenarios_settings: Vec<ScenarioSetting>,
    pub connection_pool_settings: Vec<ConnectionPoolSetting>,
    /// Scenario names to run; `None` runs every registered scenario.
    pub target_scenarios: Option<Vec<String>>,
    pub reporting: ReportingConfig,
}

/// Per-scenario overrides. Only supplied fields take effect.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScenarioSetting {
    pub scenario_name: String,
    pub warm_up_duration_secs: Option<f64>,
    pub load_simulations_settings: Option<Vec<LoadSimulationSetting>>,
    pub custom_settings: Option<String>,
}

/// Load simulations in config form, durations in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadSimulationSetting {
    RampConstant { copies: u32, during_secs: f64 },
    KeepConstant { copies: u32, during_secs: f64 },
    RampPerSec { rate: f64, during_secs: f64 },
    InjectPerSec { rate: f64, during_secs: f64 },
}

impl From<&LoadSimulationSetting> for LoadSimulation {
    fn from(setting: &LoadSimulationSetting) -> Self {
        let secs = |value: f64| Duration::from_secs_f64(value.max(0.0));
        match *setting {
            LoadSimulationSetting::RampConstant { copies, during_secs } => {
                Self::RampConstant {
                    copies,
                    during: secs(during_secs),
                }
            }
            LoadSimulationSetting::KeepConstant { copies, during_secs } => {
                Self::KeepConstant {
                    copies,
                    during: secs(during_secs),
                }
            }
            LoadSimulationSetting::RampPerSec { rate, during_secs } => Self::RampPerSec {
                rate,
                during: secs(during_secs),
            },
            LoadSimulationSetting::InjectPerSec { rate, during_secs } => Self::InjectPerSec {
                rate,
                during: secs(during_secs),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionPoolSetting {
    pub pool_name: String,
    pub connection_count: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportingConfig {
    pub send_stats_interval_secs: f64,
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            send_stats_interval_secs: 10.0,
        }
    }
}

impl ReportingConfig {
    pub fn send_stats_interval(&self) -> Duration {
        Duration::from_secs_f64(self.send_stats_interval_secs.max(1.0))
    }
}

/// Load a config file, dispatching on the extension. JSON is supported.
pub fn load(path: &Path) -> Result<EngineConfig> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();
    match ext {
        "json" => {
            let text = std::fs::read_to_string(path).map_err(|err| AppError::ConfigParseFailed {
                path: path.display().to_string(),
                cause: err.to_string(),
            })?;
            serde_json::from_str(&text).map_err(|err| AppError::ConfigParseFailed {
                path: path.display().to_string(),
                cause: err.to_string(),
            })
        }
        other => Err(AppError::UnsupportedConfigFormat { ext: other.into() }),
    }
}

/// Apply the config's overrides onto the registered scenarios and their
/// pool declarations. Names are never changed by an override.
pub fn apply(config: &EngineConfig, scenarios: &mut [Scenario]) {
    for scenario in scenarios.iter_mut() {
        if let Some(setting) = config
            .scenarios_settings
            .iter()
            .find(|setting| setting.scenario_name == scenario.name)
        {
            if let Some(secs) = setting.warm_up_duration_secs {
                scenario.warm_up_duration = Some(Duration::from_secs_f64(secs.max(0.0)));
            }
            if let Some(simulations) = &setting.load_simulations_settings {
                scenario.load_simulations =
                    simulations.iter().map(LoadSimulation::from).collect();
            }
            if let Some(custom) = &setting.custom_settings {
                scenario.custom_settings = custom.clone();
            }
        }

        for pool_args in scenario
            .steps
            .iter_mut()
            .filter_map(|step| step.pool_args.as_mut())
        {
            if let Some(setting) = config
                .connection_pool_settings
                .iter()
                .find(|setting| setting.pool_name == pool_args.name)
            {
                pool_args.count = setting.connection_count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::Response;
    use crate::scenario::Step;

    #[test]
    fn parses_a_full_config() {
        let text = r#"{
            "scenarios_settings": [{
                "scenario_name": "checkout",
                "warm_up_duration_secs": 5.0,
                "load_simulations_settings": [
                    {"keep_constant": {"copies": 10, "during_secs": 30.0}},
                    {"inject_per_sec": {"rate": 50.0, "during_secs": 10.0}}
                ],
                "custom_settings": "{\"region\":\"eu\"}"
            }],
            "connection_pool_settings": [
                {"pool_name": "db", "connection_count": 8}
            ],
            "target_scenarios": ["checkout"],
            "reporting": {"send_stats_interval_secs": 5.0}
        }"#;
        let config: EngineConfig = serde_json::from_str(text).unwrap();
        assert_eq!(config.scenarios_settings.len(), 1);
        assert_eq!(config.connection_pool_settings[0].connection_count, 8);
        assert_eq!(
            config.reporting.send_stats_interval(),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn empty_config_defaults_everything() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert!(config.scenarios_settings.is_empty());
        assert!(config.target_scenarios.is_none());
        assert_eq!(
            config.reporting.send_stats_interval(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn overrides_touch_only_supplied_fields_and_never_names() {
        let mut scenarios = vec![Scenario::builder()
            .name("checkout")
            .steps(vec![Step::new("pay", |_ctx| async { Response::ok() })])
            .warm_up_duration(Some(Duration::from_secs(1)))
            .load_simulations(vec![LoadSimulation::KeepConstant {
                copies: 1,
                during: Duration::from_secs(1),
            }])
            .custom_settings("programmatic")
            .build()];

        let config = EngineConfig {
            scenarios_settings: vec![ScenarioSetting {
                scenario_name: "checkout".into(),
                warm_up_duration_secs: Some(7.0),
                load_simulations_settings: None,
                custom_settings: None,
            }],
            ..EngineConfig::default()
        };
        apply(&config, &mut scenarios);

        let scenario = &scenarios[0];
        assert_eq!(scenario.name, "checkout");
        assert_eq!(scenario.warm_up_duration, Some(Duration::from_secs(7)));
        // unsupplied fields keep programmatic values
        assert_eq!(scenario.custom_settings, "programmatic");
        assert_eq!(scenario.load_simulations.len(), 1);
        assert_eq!(scenario.steps[0].name, "pay");
    }

    #[test]
    fn pool_count_override_matches_by_declared_name() {
        use crate::pool::ConnectionPoolArgs;
        use std::sync::Arc;

        let args = ConnectionPoolArgs::new(
            "db",
            2,
            |_i, _ctx| async { Ok(0u8) },
            |_c: Arc<u8>, _ctx| async { Ok(()) },
        );
        let mut scenarios = vec![Scenario::builder()
            .name("s")
            .steps(vec![
                Step::new("a", |_ctx| async { Response::ok() }).with_pool(args)
            ])
            .build()];
        let config = EngineConfig {
            connection_pool_settings: vec![ConnectionPoolSetting {
                pool_name: "db".into(),
                connection_count: 16,
            }],
            ..EngineConfig::default()
        };
        apply(&config, &mut scenarios);
        assert_eq!(scenarios[0].steps[0].pool_args.as_ref().unwrap().count, 16);
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = load(Path::new("config.toml")).unwrap_err();
        assert!(matches!(err, AppError::UnsupportedConfigFormat { ext } if ext == "toml"));
    }

    #[test]
    fn missing_file_is_a_parse_failure() {
        let err = load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, AppError::ConfigParseFailed { .. }));
    }
}
