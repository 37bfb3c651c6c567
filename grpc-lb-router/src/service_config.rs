//! Service config parsing and per-client choice selection.

use crate::lb::LbPolicyRegistry;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Language this client identifies as when matching `clientLanguage`.
pub const CLIENT_LANGUAGE: &str = "rust";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceConfigError {
    #[error("invalid service config JSON: {0}")]
    Json(String),
    #[error("service config choices must be a JSON array")]
    NotAnArray,
    #[error("no service config choice could be selected: {}", .0.join("; "))]
    NoValidChoice(Vec<String>),
}

/// A parsed service config.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    json: String,
    lb_policy: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServiceConfig {
    #[serde(default)]
    load_balancing_config: Vec<Map<String, Value>>,
    load_balancing_policy: Option<String>,
}

impl ServiceConfig {
    /// Parse `json`, recognising the policies of the global registry.
    pub fn from_json(json: &str) -> Result<Self, ServiceConfigError> {
        Self::from_json_with_registry(json, &LbPolicyRegistry::global())
    }

    /// Parse `json`. The first `loadBalancingConfig` entry naming a
    /// registered policy wins over the deprecated `loadBalancingPolicy`.
    pub fn from_json_with_registry(
        json: &str,
        registry: &LbPolicyRegistry,
    ) -> Result<Self, ServiceConfigError> {
        let raw: RawServiceConfig =
            serde_json::from_str(json).map_err(|e| ServiceConfigError::Json(e.to_string()))?;

        let configured = raw
            .load_balancing_config
            .iter()
            .filter_map(|entry| entry.keys().next())
            .find(|name| registry.contains(name))
            .cloned();
        let lb_policy = configured.or_else(|| {
            raw.load_balancing_policy
                .map(|name| name.to_ascii_lowercase())
        });

        Ok(Self {
            json: json.to_string(),
            lb_policy,
        })
    }

    /// The load-balancing policy this config asks for, if any.
    pub fn lb_policy_name(&self) -> Option<&str> {
        self.lb_policy.as_deref()
    }

    pub fn as_json(&self) -> &str {
        &self.json
    }
}

/// Who is choosing among service config choices.
#[derive(Debug, Clone, Default)]
pub struct ChoiceContext {
    pub hostname: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Choice {
    client_language: Option<Vec<String>>,
    client_hostname: Option<Vec<String>>,
    percentage: Option<u64>,
    service_config: Option<Map<String, Value>>,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

impl Choice {
    fn applies(&self, ctx: &ChoiceContext, rng: &mut impl Rng) -> bool {
        if let Some(languages) = &self.client_language {
            if !languages
                .iter()
                .any(|language| language.eq_ignore_ascii_case(CLIENT_LANGUAGE))
            {
                return false;
            }
        }
        if let Some(hostnames) = &self.client_hostname {
            match &ctx.hostname {
                Some(hostname) if hostnames.iter().any(|h| h == hostname) => {}
                _ => return false,
            }
        }
        if let Some(percentage) = self.percentage {
            let draw: u64 = rng.gen_range(0..100);
            if percentage == 0 || draw > percentage {
                return false;
            }
        }
        true
    }
}

/// Select the service config for this client from a JSON array of choices.
///
/// Returns the first `serviceConfig` whose filters all pass. Malformed
/// choices are skipped and logged; if no choice is selected and at least
/// one was malformed, selection fails. `Ok(None)` means nothing applied.
pub fn choose_service_config(
    choices: &str,
    ctx: &ChoiceContext,
    rng: &mut impl Rng,
) -> Result<Option<String>, ServiceConfigError> {
    let choices: Value =
        serde_json::from_str(choices).map_err(|e| ServiceConfigError::Json(e.to_string()))?;
    let Value::Array(choices) = choices else {
        return Err(ServiceConfigError::NotAnArray);
    };

    let mut errors = Vec::new();
    for (index, choice) in choices.into_iter().enumerate() {
        let choice: Choice = match serde_json::from_value(choice) {
            Ok(choice) => choice,
            Err(error) => {
                errors.push(format!("choice {index}: {error}"));
                continue;
            }
        };
        for field in choice.unknown.keys() {
            errors.push(format!("choice {index}: unknown field '{field}'"));
        }
        let Some(config) = &choice.service_config else {
            continue;
        };
        if choice.applies(ctx, rng) {
            for error in &errors {
                tracing::warn!(%error, "ignored malformed service config choice");
            }
            return Ok(Some(Value::Object(config.clone()).to_string()));
        }
    }

    if errors.is_empty() {
        Ok(None)
    } else {
        Err(ServiceConfigError::NoValidChoice(errors))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn choose(choices: &str, hostname: Option<&str>) -> Result<Option<String>, ServiceConfigError> {
        let ctx = ChoiceContext {
            hostname: hostname.map(str::to_string),
        };
        choose_service_config(choices, &ctx, &mut StdRng::seed_from_u64(7))
    }

    #[test]
    fn language_filter_skips_other_clients() {
        let chosen = choose(
            r#"[{"clientLanguage":["other"],"serviceConfig":{"a":1}},{"serviceConfig":{"b":2}}]"#,
            None,
        );
        assert_eq!(chosen, Ok(Some(r#"{"b":2}"#.to_string())));
    }

    #[test]
    fn language_matches_case_insensitively() {
        let chosen = choose(
            r#"[{"clientLanguage":["go","RUST"],"serviceConfig":{"a":1}}]"#,
            None,
        );
        assert_eq!(chosen, Ok(Some(r#"{"a":1}"#.to_string())));
    }

    #[test]
    fn hostname_filter_requires_a_match() {
        let choices = r#"[{"clientHostname":["box-1"],"serviceConfig":{"a":1}}]"#;
        assert_eq!(choose(choices, Some("box-2")), Ok(None));
        assert_eq!(choose(choices, None), Ok(None));
        assert_eq!(choose(choices, Some("box-1")), Ok(Some(r#"{"a":1}"#.to_string())));
    }

    #[test]
    fn zero_percentage_never_applies_and_full_always_does() {
        for seed in 0..32 {
            let mut rng = StdRng::seed_from_u64(seed);
            let ctx = ChoiceContext::default();
            let chosen = choose_service_config(
                r#"[{"percentage":0,"serviceConfig":{"a":1}},{"percentage":100,"serviceConfig":{"b":2}}]"#,
                &ctx,
                &mut rng,
            );
            assert_eq!(chosen, Ok(Some(r#"{"b":2}"#.to_string())));
        }
    }

    #[test]
    fn unknown_fields_are_not_fatal() {
        let chosen = choose(r#"[{"futureField":true,"serviceConfig":{"a":1}}]"#, None);
        assert_eq!(chosen, Ok(Some(r#"{"a":1}"#.to_string())));
    }

    #[test]
    fn malformed_choices_fail_selection_if_nothing_is_chosen() {
        let chosen = choose(r#"[{"clientLanguage":"rust","serviceConfig":{"a":1}}, 3]"#, None);
        assert!(matches!(chosen, Err(ServiceConfigError::NoValidChoice(errors)) if errors.len() == 2));
    }

    #[test]
    fn top_level_must_be_an_array() {
        assert_eq!(choose(r#"{"serviceConfig":{}}"#, None), Err(ServiceConfigError::NotAnArray));
        assert!(matches!(choose("[", None), Err(ServiceConfigError::Json(_))));
    }

    #[test]
    fn load_balancing_config_wins_over_deprecated_policy() {
        let config = ServiceConfig::from_json(
            r#"{"loadBalancingPolicy":"pick_first","loadBalancingConfig":[{"xds_experimental":{}},{"round_robin":{}}]}"#,
        )
        .unwrap();
        assert_eq!(config.lb_policy_name(), Some("round_robin"));
    }

    #[test]
    fn deprecated_policy_name_is_case_insensitive() {
        let config = ServiceConfig::from_json(r#"{"loadBalancingPolicy":"ROUND_ROBIN"}"#).unwrap();
        assert_eq!(config.lb_policy_name(), Some("round_robin"));

        let config = ServiceConfig::from_json(r#"{"methodConfig":[]}"#).unwrap();
        assert_eq!(config.lb_policy_name(), None);
    }
}
