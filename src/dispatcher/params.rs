//! Parameter resolution
//!
//! Node params are resolved once per dispatch. The shipped resolver treats
//! string values as minijinja templates rendered against the configured
//! `[variables]` (as `vars`) and the run's trigger data (as `trigger`).

use minijinja::{Environment, ErrorKind, UndefinedBehavior, context};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParamError {
    #[error("param '{param}' references an undefined value: {message}")]
    Undefined { param: String, message: String },

    #[error("param '{param}' failed to render: {message}")]
    Render { param: String, message: String },
}

/// Turns a node's declared params into concrete values
pub trait ParamResolver: Send + Sync {
    fn resolve(
        &self,
        params: &BTreeMap<String, Value>,
        trigger: &Value,
    ) -> Result<BTreeMap<String, Value>, ParamError>;
}

/// Renders string params as templates; strict about undefined values
pub struct TemplateParamResolver {
    env: Environment<'static>,
    variables: BTreeMap<String, Value>,
}

impl TemplateParamResolver {
    pub fn new(variables: BTreeMap<String, Value>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self { env, variables }
    }

    fn render_value(&self, param: &str, value: &Value, trigger: &Value) -> Result<Value, ParamError> {
        match value {
            Value::String(s) if is_template(s) => {
                let ctx = context! { vars => &self.variables, trigger => trigger };
                self.env
                    .render_str(s, ctx)
                    .map(Value::String)
                    .map_err(|e| convert_error(param, e))
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(param, item, trigger))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.render_value(param, v, trigger)?)))
                .collect::<Result<serde_json::Map<_, _>, _>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

impl Default for TemplateParamResolver {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl ParamResolver for TemplateParamResolver {
    fn resolve(
        &self,
        params: &BTreeMap<String, Value>,
        trigger: &Value,
    ) -> Result<BTreeMap<String, Value>, ParamError> {
        params
            .iter()
            .map(|(name, value)| Ok((name.clone(), self.render_value(name, value, trigger)?)))
            .collect()
    }
}

fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

fn convert_error(param: &str, err: minijinja::Error) -> ParamError {
    let message = err.to_string();
    match err.kind() {
        ErrorKind::UndefinedError => ParamError::Undefined {
            param: param.to_string(),
            message,
        },
        _ => ParamError::Render {
            param: param.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_renders_vars_and_trigger() {
        let resolver =
            TemplateParamResolver::new(params(&[("bucket", json!("s3://data"))]));
        let resolved = resolver
            .resolve(
                &params(&[
                    ("path", json!("{{ vars.bucket }}/{{ trigger.date }}")),
                    ("limit", json!(10)),
                ]),
                &json!({"date": "2026-10-14"}),
            )
            .unwrap();
        assert_eq!(resolved["path"], json!("s3://data/2026-10-14"));
        assert_eq!(resolved["limit"], json!(10));
    }

    #[test]
    fn test_nested_values_are_rendered() {
        let resolver = TemplateParamResolver::default();
        let resolved = resolver
            .resolve(
                &params(&[("opts", json!({"tags": ["{{ trigger.env }}", "fixed"]}))]),
                &json!({"env": "prod"}),
            )
            .unwrap();
        assert_eq!(resolved["opts"], json!({"tags": ["prod", "fixed"]}));
    }

    #[test]
    fn test_plain_strings_pass_through() {
        let resolver = TemplateParamResolver::default();
        let resolved = resolver
            .resolve(&params(&[("note", json!("{# not a template"))]), &Value::Null)
            .unwrap();
        assert_eq!(resolved["note"], json!("{# not a template"));
    }

    #[test]
    fn test_undefined_is_an_error() {
        let resolver = TemplateParamResolver::default();
        let err = resolver
            .resolve(&params(&[("path", json!("{{ trigger.missing }}"))]), &json!({}))
            .unwrap_err();
        assert!(matches!(err, ParamError::Undefined { ref param, .. } if param == "path"));
    }

    #[test]
    fn test_syntax_error_is_render_error() {
        let resolver = TemplateParamResolver::default();
        let err = resolver
            .resolve(&params(&[("bad", json!("{{ unclosed"))]), &Value::Null)
            .unwrap_err();
        assert!(matches!(err, ParamError::Render { .. }));
    }
}
