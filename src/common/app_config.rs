// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<MicarocksConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static MicarocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = MicarocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static MicarocksConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = MicarocksConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static MicarocksConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("MICAROCKS_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("micarocks.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $MICAROCKS_CONFIG or create ./micarocks.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct MicarocksConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl MicarocksConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let cfg: MicarocksConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }

    pub fn effective_log_filter(&self) -> String {
        match &self.log_filter {
            Some(filter) if !filter.trim().is_empty() => filter.clone(),
            _ => self.log_level.clone(),
        }
    }
}

fn default_exec_threads() -> usize {
    0
}

fn default_driver_quantum_ms() -> u64 {
    1000
}

fn default_max_buffer_mb() -> u64 {
    32
}

fn default_max_task_memory_mb() -> u64 {
    256
}

fn default_operator_pre_allocated_mb() -> u64 {
    16
}

#[derive(Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Worker threads for the driver executor. 0 means one per CPU.
    #[serde(default = "default_exec_threads")]
    pub exec_threads: usize,

    /// Cooperative time slice handed to a driver per schedule.
    #[serde(default = "default_driver_quantum_ms")]
    pub driver_quantum_ms: u64,

    /// Soft cap on buffered output pages per task.
    #[serde(default = "default_max_buffer_mb")]
    pub max_buffer_mb: u64,

    /// Logical memory limit per task.
    #[serde(default = "default_max_task_memory_mb")]
    pub max_task_memory_mb: u64,

    /// Memory pre-reserved for each operator at creation.
    #[serde(default = "default_operator_pre_allocated_mb")]
    pub operator_pre_allocated_mb: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            exec_threads: default_exec_threads(),
            driver_quantum_ms: default_driver_quantum_ms(),
            max_buffer_mb: default_max_buffer_mb(),
            max_task_memory_mb: default_max_task_memory_mb(),
            operator_pre_allocated_mb: default_operator_pre_allocated_mb(),
        }
    }
}

impl RuntimeConfig {
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            return self.exec_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: MicarocksConfig = toml::from_str("").expect("parse empty config");
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.runtime.driver_quantum_ms, 1000);
        assert!(cfg.runtime.actual_exec_threads() >= 1);
    }

    #[test]
    fn log_filter_takes_precedence() {
        let cfg: MicarocksConfig = toml::from_str(
            r#"
log_level = "debug"
log_filter = "micarocks=trace"
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.effective_log_filter(), "micarocks=trace");
    }

    #[test]
    fn runtime_section_overrides() {
        let cfg: MicarocksConfig = toml::from_str(
            r#"
[runtime]
exec_threads = 4
driver_quantum_ms = 100
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.runtime.actual_exec_threads(), 4);
        assert_eq!(cfg.runtime.driver_quantum_ms, 100);
        assert_eq!(cfg.runtime.max_buffer_mb, 32);
    }
}
