//! Messages sent to the script-side loader, and the loader itself.

use std::cmp::Ordering;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use super::engine::MODULES_FUNCTION;
use super::module::ViewModule;
use crate::config::HostConfig;
use crate::js::serialize::{encode_string, script_name, serialize_object, to_literal, ScriptValue};
use crate::js::ScriptChannel;

pub const VIEW_INITIALIZED_EVENT: &str = "ViewInitialized";
pub const VIEW_LOADED_EVENT: &str = "ViewLoaded";
pub const VIEW_DESTROYED_EVENT: &str = "ViewDestroyed";

const LOADER_OBJECT: &str = "Loader";
const LOADER_SCRIPT: &str = include_str!("loader.js");

/// Script that installs the loader. It announces the main view once done.
pub fn bootstrap_script(config: &HostConfig) -> String {
    let options = json!({
        "debug": config.debug_mode,
        "modulesFunction": MODULES_FUNCTION,
        "events": {
            "initialized": VIEW_INITIALIZED_EVENT,
            "loaded": VIEW_LOADED_EVENT,
            "destroyed": VIEW_DESTROYED_EVENT,
        },
    });
    format!("var __viewhost_options = {options};\n{LOADER_SCRIPT}")
}

/// Source identifiers drop their `.js` suffix and use forward slashes.
pub fn normalize_url(url: &str) -> String {
    let url = url.replace('\\', "/");
    match url.strip_suffix(".js") {
        Some(stripped) => stripped.to_string(),
        None => url,
    }
}

/// The object literal handed to the component's constructor: declared
/// events as `undefined`, properties with their values, keyed by script
/// name. Entries are sorted by their declared name before renaming, using
/// [`declared_name_order`].
pub fn native_object_literal(module: &ViewModule) -> String {
    let mut entries: Vec<(String, ScriptValue)> = module
        .events()
        .iter()
        .map(|event| (event.clone(), ScriptValue::Undefined))
        .chain(
            module
                .properties()
                .iter()
                .map(|(key, value)| (key.clone(), ScriptValue::Json(value.clone()))),
        )
        .collect();
    entries.sort_by(|a, b| declared_name_order(&a.0, &b.0));
    let renamed: Vec<(String, ScriptValue)> = entries
        .into_iter()
        .map(|(key, value)| (script_name(&key), value))
        .collect();
    serialize_object(&renamed)
}

/// Case-insensitive order, with lower case first when two names differ
/// only in case.
fn declared_name_order(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| b.cmp(a))
}

/// Fingerprint of a component's observable shape and property values.
pub fn component_hash(literal: &str) -> String {
    STANDARD.encode(Sha256::digest(literal.as_bytes()))
}

/// One call into the loader, with its arguments already rendered.
#[derive(Debug, Clone, PartialEq)]
pub struct LoaderMessage {
    function: &'static str,
    args: Vec<String>,
}

impl LoaderMessage {
    fn new(function: &'static str, args: Vec<String>) -> Self {
        Self { function, args }
    }

    pub fn function(&self) -> String {
        format!("{LOADER_OBJECT}.{}", self.function)
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn script(&self) -> String {
        format!("{}({})", self.function(), self.args.join(","))
    }

    pub fn send(&self, channel: &ScriptChannel) {
        tracing::debug!(target: "view", function = self.function, "loader message");
        let args: Vec<Value> = self.args.iter().cloned().map(Value::String).collect();
        channel.execute_function(&self.function(), false, &args);
    }

    pub fn load_default_stylesheet(url: &str) -> Self {
        Self::new("loadDefaultStyleSheet", vec![encode_string(&normalize_url(url))])
    }

    pub fn show_error_message(message: &str) -> Self {
        Self::new("showErrorMessage", vec![encode_string(message)])
    }

    pub fn load_plugins(plugins: &[std::sync::Arc<ViewModule>], frame: &str) -> Self {
        let tuples: Vec<String> = plugins
            .iter()
            .map(|plugin| {
                format!(
                    "[{},{},{},{},{}]",
                    encode_string(plugin.name()),
                    encode_string(plugin.instance_name()),
                    encode_string(&normalize_url(plugin.main_source())),
                    encode_string(&plugin.native_object_full_name(frame)),
                    source_list(plugin.dependency_sources()),
                )
            })
            .collect();
        Self::new(
            "loadPlugins",
            vec![format!("[{}]", tuples.join(",")), encode_string(frame)],
        )
    }

    pub fn load_component(
        component: &ViewModule,
        frame: &str,
        cache_capacity: usize,
        has_stylesheet: bool,
        has_plugins: bool,
    ) -> Self {
        let literal = native_object_literal(component);
        let hash = component_hash(&literal);
        let css: Vec<String> = component
            .css_sources()
            .iter()
            .map(|source| encode_string(&normalize_url(source)))
            .collect();
        Self::new(
            "loadComponent",
            vec![
                encode_string(component.name()),
                encode_string(component.instance_name()),
                encode_string(&component.native_object_full_name(frame)),
                encode_string(&normalize_url(component.main_source())),
                source_list(component.dependency_sources()),
                format!("[{}]", css.join(",")),
                to_literal(&Value::from(cache_capacity)),
                has_stylesheet.to_string(),
                has_plugins.to_string(),
                literal,
                encode_string(frame),
                encode_string(&hash),
            ],
        )
    }
}

/// Dependencies are sent last-declared first so the entry module loads last.
fn source_list(sources: &[String]) -> String {
    let rendered: Vec<String> = sources
        .iter()
        .rev()
        .map(|source| encode_string(&normalize_url(source)))
        .collect();
    format!("[{}]", rendered.join(","))
}
