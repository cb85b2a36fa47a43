//! Values measured outside the controller: one-wire probes and script-derived sensors.

use crate::models::telemetry::FactKind;
use serde::Deserialize;
use std::process::Command;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProvidedValue {
    pub address: i32,
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// A synchronous source of sensor values keyed by address.
pub trait ValueProvider {
    /// Fact type the provided values are catalogued under.
    fn kind(&self) -> FactKind;
    fn scan(&mut self) -> Result<Vec<ProvidedValue>, String>;
}

/// Runs a script that prints a JSON array of [`ProvidedValue`] objects.
pub struct ScriptSensor {
    script: String,
}

impl ScriptSensor {
    pub fn new(script: impl Into<String>) -> Self {
        ScriptSensor { script: script.into() }
    }
}

pub fn parse_script_output(stdout: &str) -> Result<Vec<ProvidedValue>, String> {
    let mut de = serde_json::Deserializer::from_str(stdout.trim());
    serde_path_to_error::deserialize(&mut de).map_err(|e| format!("bad sensor script output at {}", e))
}

impl ValueProvider for ScriptSensor {
    fn kind(&self) -> FactKind {
        FactKind::Script
    }

    fn scan(&mut self) -> Result<Vec<ProvidedValue>, String> {
        let output = Command::new(&self.script)
            .output()
            .map_err(|e| format!("running {} failed: {}", self.script, e))?;
        if !output.status.success() {
            return Err(format!("{} exited with {}", self.script, output.status));
        }
        parse_script_output(&String::from_utf8_lossy(&output.stdout))
    }
}
