//! Analysis parameters

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{OrchestratorError, Result};

/// Parameter name -> value
pub type ParameterValues = BTreeMap<String, Value>;

/// Declared parameter of an analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_bound: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ParameterSpec {
    pub fn new(name: impl Into<String>, default: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            default: default.into(),
            lower_bound: None,
            upper_bound: None,
            choices: None,
            description: None,
        }
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower_bound = Some(lower);
        self.upper_bound = Some(upper);
        self
    }

    pub fn with_choices<I, V>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Check `value` against the type of the default, the bounds and the choices
    pub fn validate(&self, value: &Value) -> Result<()> {
        let invalid = |reason: String| OrchestratorError::InvalidParameter {
            name: self.name.clone(),
            reason,
        };
        if !self.default.is_null() && kind_of(value) != kind_of(&self.default) {
            return Err(invalid(format!(
                "expected a {}, got {}",
                kind_of(&self.default),
                value
            )));
        }
        if self.lower_bound.is_some() || self.upper_bound.is_some() {
            let number = value
                .as_f64()
                .ok_or_else(|| invalid(format!("bounded parameter needs a number, got {value}")))?;
            if let Some(lower) = self.lower_bound {
                if number < lower {
                    return Err(invalid(format!("{number} is below the lower bound {lower}")));
                }
            }
            if let Some(upper) = self.upper_bound {
                if number > upper {
                    return Err(invalid(format!("{number} is above the upper bound {upper}")));
                }
            }
        }
        if let Some(choices) = &self.choices {
            if !choices.contains(value) {
                let allowed: Vec<String> = choices.iter().map(Value::to_string).collect();
                return Err(invalid(format!(
                    "{value} is not one of {}",
                    allowed.join(", ")
                )));
            }
        }
        Ok(())
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Defaults of `specs` overlaid with `overrides`, every value validated
pub fn resolve_values(
    specs: &BTreeMap<String, ParameterSpec>,
    overrides: &ParameterValues,
) -> Result<ParameterValues> {
    if let Some(unknown) = overrides.keys().find(|name| !specs.contains_key(*name)) {
        return Err(OrchestratorError::UnknownParameter(unknown.clone()));
    }
    let mut values = ParameterValues::new();
    for (name, spec) in specs {
        let value = overrides.get(name).unwrap_or(&spec.default).clone();
        spec.validate(&value)?;
        values.insert(name.clone(), value);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bounds() {
        let spec = ParameterSpec::new("threshold", 0.5).with_bounds(0.0, 1.0);
        assert!(spec.validate(&json!(0.25)).is_ok());
        assert!(spec.validate(&json!(1.5)).is_err());
        assert!(spec.validate(&json!("high")).is_err());
    }

    #[test]
    fn test_choices() {
        let spec = ParameterSpec::new("method", "fast").with_choices(["fast", "accurate"]);
        assert!(spec.validate(&json!("accurate")).is_ok());
        let err = spec.validate(&json!("other")).unwrap_err();
        assert!(err.to_string().contains("not one of"));
    }

    #[test]
    fn test_resolve_values() {
        let mut specs = BTreeMap::new();
        specs.insert("a".to_string(), ParameterSpec::new("a", 1));
        specs.insert("b".to_string(), ParameterSpec::new("b", "x"));

        let mut overrides = ParameterValues::new();
        overrides.insert("a".into(), json!(2));
        let values = resolve_values(&specs, &overrides).unwrap();
        assert_eq!(values["a"], json!(2));
        assert_eq!(values["b"], json!("x"));

        overrides.insert("c".into(), json!(true));
        assert!(matches!(
            resolve_values(&specs, &overrides),
            Err(OrchestratorError::UnknownParameter(name)) if name == "c"
        ));
    }
}
