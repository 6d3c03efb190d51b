/*
    IronPC
    https://github.com/ironpc/ironpc

    Copyright 2023-2026 IronPC Contributors

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    coreconfig.rs

    Startup configuration for the emulation core, deserialized from a TOML
    fragment supplied by whatever frontend embeds the core.

*/

use serde_derive::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_MEM_SIZE: usize = 16 * 1024 * 1024;
pub const DEFAULT_CPU_COUNT: usize = 1;
pub const MAX_CPU_COUNT: usize = 8;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't parse core configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("invalid cpu count: {0} (1-{MAX_CPU_COUNT} supported)")]
    InvalidCpuCount(usize),
    #[error("memory size must be a multiple of 4K: {0}")]
    UnalignedMemSize(usize),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub mem_size: usize,
    pub cpu_count: usize,
    pub quantum_instructions: u32,
    pub trace_on: bool,
    pub trace_file: Option<PathBuf>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mem_size: DEFAULT_MEM_SIZE,
            cpu_count: DEFAULT_CPU_COUNT,
            quantum_instructions: 5000,
            trace_on: false,
            trace_file: None,
        }
    }
}

impl CoreConfig {
    pub fn from_toml(fragment: &str) -> Result<CoreConfig, ConfigError> {
        let config: CoreConfig = toml::from_str(fragment)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpu_count == 0 || self.cpu_count > MAX_CPU_COUNT {
            return Err(ConfigError::InvalidCpuCount(self.cpu_count));
        }
        if self.mem_size & 0xFFF != 0 {
            return Err(ConfigError::UnalignedMemSize(self.mem_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_defaults_from_empty_fragment() {
        let config = CoreConfig::from_toml("").unwrap();
        assert_eq!(config.mem_size, DEFAULT_MEM_SIZE);
        assert_eq!(config.cpu_count, 1);
    }

    #[test]
    fn rejects_bad_cpu_count() {
        let result = CoreConfig::from_toml("cpu_count = 0");
        assert!(result.is_err());
    }

    #[test]
    fn parses_explicit_values() {
        let config = CoreConfig::from_toml("mem_size = 4194304\ncpu_count = 2\ntrace_on = true").unwrap();
        assert_eq!(config.mem_size, 4 * 1024 * 1024);
        assert_eq!(config.cpu_count, 2);
        assert!(config.trace_on);
    }
}
