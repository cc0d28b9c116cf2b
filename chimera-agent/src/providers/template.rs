//! Placeholder rendering and structured merges for profiles and cloud-init.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::config::ProxySettings;

/// Values available to `{{ key }}` placeholders.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new(container_name: &str, proxy: &ProxySettings) -> Self {
        let mut values = HashMap::new();
        values.insert("container_name".to_string(), container_name.to_string());
        let proxies = [
            ("http_proxy", &proxy.http_proxy),
            ("https_proxy", &proxy.https_proxy),
            ("no_proxy", &proxy.no_proxy),
        ];
        for (key, value) in proxies {
            values.insert(format!("proxy.{key}"), value.clone().unwrap_or_default());
        }
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Replace every `{{ key }}` with its value. Unknown keys render empty.
pub fn render(template: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                out.push_str(ctx.get(key).unwrap_or_default());
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Deep merge `overlay` into `base`: nested maps merge key by key, any
/// other value replaces.
pub fn merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => merge(existing, incoming),
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
