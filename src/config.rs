// BiPact: execution core for two-party off-chain contracts
//
// SPDX-License-Identifier: Apache-2.0
//
// Designed in 2024-2025 by the BiPact developers
// Written in 2024-2025 by the BiPact developers
//
// Copyright (C) 2024-2025 BiPact developers.
// All rights under the above copyrights are reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//        http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

use core::str::FromStr;
use std::io;
use std::path::PathBuf;
#[cfg(feature = "serde")]
use std::{fs, path::Path};

/// Default service fee charged for contract deployment, in sats.
pub const DEFAULT_DEPLOY_SERVICE_FEE: u64 = 1000;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Display)]
#[display(lowercase)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "lowercase"))]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            other => Err(ConfigError::UnknownNetwork(other.to_owned())),
        }
    }
}

/// Node-local runtime configuration.
///
/// Protocol constants shared by both peers are not part of it.
#[derive(Clone, Eq, PartialEq, Debug)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase", default))]
pub struct RuntimeConfig {
    pub network: Network,
    /// Service fee charged for contract deployment, in sats.
    pub deploy_service_fee: u64,
    /// Filter directives for the log output, like `info` or `bipact=debug`.
    pub log_filter: String,
    pub data_dir: PathBuf,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            deploy_service_fee: DEFAULT_DEPLOY_SERVICE_FEE,
            log_filter: s!("info"),
            data_dir: PathBuf::from("data"),
        }
    }
}

#[cfg(feature = "serde")]
impl RuntimeConfig {
    /// Reads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path)?;
        toml::from_str(&data).map_err(|e| ConfigError::Format(e.to_string()))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Format(e.to_string()))
    }
}

#[derive(Debug, Display, Error, From)]
#[display(inner)]
pub enum ConfigError {
    #[display("unknown network '{0}'")]
    UnknownNetwork(String),

    #[from]
    Io(io::Error),

    #[display("invalid configuration: {0}")]
    Format(String),
}

#[cfg(all(test, feature = "serde"))]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]

    use super::*;

    #[test]
    fn partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bipact.toml");
        fs::write(&path, "network = \"testnet\"\ndeployServiceFee = 2500\n").unwrap();
        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.deploy_service_fee, 2500);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bipact.toml");
        let config = RuntimeConfig { network: Network::Testnet, log_filter: s!("bipact=debug"), ..default!() };
        config.save(&path).unwrap();
        assert_eq!(RuntimeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn bad_network() {
        assert!(matches!("regtest".parse::<Network>(), Err(ConfigError::UnknownNetwork(_))));
        assert!(toml::from_str::<RuntimeConfig>("network = \"signet\"").is_err());
    }
}
