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

use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use amplify::confinement::{SmallBlob, TinyString};
use commit_verify::CommitId;

use crate::{StaticDigest, LIB_NAME_BIPACT};

pub const URL_SEPARATOR: char = '_';

#[derive(Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ParamsError {
    /// invalid contract url '{0}'; expected `<channel>_<asset>_<template>`.
    InvalidUrl(String),

    /// unknown contract template '{0}'.
    UnknownTemplate(String),

    /// invalid asset name '{0}'.
    InvalidAsset(String),

    /// asset protocol '{0}' is not supported.
    UnsupportedProtocol(String),

    /// only fungible assets may be used with contracts, while '{0}' is not fungible.
    NonFungible(String),

    /// invalid address '{0}'.
    InvalidAddress(String),

    /// contract validity window ends at block {end} before it starts at block {start}.
    InvalidWindow { start: u64, end: u64 },
}

/// Contract templates known to the runtime.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT, tags = repr, try_from_u8, into_u8)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
#[repr(u8)]
pub enum TemplateName {
    #[strict_type(dumb)]
    #[display("swap.tc")]
    Swap = 1,
    #[display("amm.tc")]
    Amm = 2,
    #[display("vault.tc")]
    Vault = 3,
    #[display("launchpool.tc")]
    LaunchPool = 4,
    #[display("transcend.tc")]
    Transcend = 5,
    #[display("dao.tc")]
    Dao = 6,
}

impl FromStr for TemplateName {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "swap.tc" => Self::Swap,
            "amm.tc" => Self::Amm,
            "vault.tc" => Self::Vault,
            "launchpool.tc" => Self::LaunchPool,
            "transcend.tc" => Self::Transcend,
            "dao.tc" => Self::Dao,
            other => return Err(ParamsError::UnknownTemplate(other.to_owned())),
        })
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display)]
#[display(lowercase)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT, tags = repr, try_from_u8, into_u8)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
#[repr(u8)]
pub enum AssetProtocol {
    #[strict_type(dumb)]
    Ordx = 1,
    Runes = 2,
}

/// Asset name in `<protocol>:<type>:<ticker>` form. Contracts operate on fungible (`f`) assets
/// only.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct AssetName {
    pub protocol: AssetProtocol,
    pub ticker: TinyString,
}

impl AssetName {
    pub fn new(protocol: AssetProtocol, ticker: &str) -> Result<Self, ParamsError> {
        let invalid = || ParamsError::InvalidAsset(ticker.to_owned());
        if ticker.is_empty() || ticker.contains(URL_SEPARATOR) || ticker.contains(':') {
            return Err(invalid());
        }
        let ticker = match protocol {
            AssetProtocol::Ordx => {
                if !ticker.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(invalid());
                }
                ticker.to_ascii_lowercase()
            }
            AssetProtocol::Runes => {
                if ticker.contains('.') {
                    return Err(invalid());
                }
                ticker.to_owned()
            }
        };
        let ticker = TinyString::try_from(ticker).map_err(|_| invalid())?;
        Ok(Self { protocol, ticker })
    }
}

impl Display for AssetName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { write!(f, "{}:f:{}", self.protocol, self.ticker.as_str()) }
}

impl FromStr for AssetName {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(protocol), Some(ty), Some(ticker), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParamsError::InvalidAsset(s.to_owned()));
        };
        let protocol = match protocol {
            "ordx" => AssetProtocol::Ordx,
            "runes" => AssetProtocol::Runes,
            other => return Err(ParamsError::UnsupportedProtocol(other.to_owned())),
        };
        if ty != "f" {
            return Err(ParamsError::NonFungible(s.to_owned()));
        }
        AssetName::new(protocol, ticker)
    }
}

/// Address on the settlement or base layer, as an opaque string.
#[derive(Wrapper, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, From)]
#[wrapper(Deref)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct Address(TinyString);

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result { f.write_str(self.0.as_str()) }
}

impl FromStr for Address {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.contains(URL_SEPARATOR) || s.contains('-') || s.contains(char::is_whitespace) {
            return Err(ParamsError::InvalidAddress(s.to_owned()));
        }
        TinyString::try_from(s.to_owned())
            .map(Self)
            .map_err(|_| ParamsError::InvalidAddress(s.to_owned()))
    }
}

/// Immutable parameters of a deployed contract.
///
/// Their strict commitment is the static digest of the contract, computed once at deployment and
/// compared first during every peer consistency check.
#[derive(Clone, Eq, PartialEq, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[derive(CommitEncode)]
#[commit_encode(strategy = strict, id = StaticDigest)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct ContractParams {
    pub template: TemplateName,
    pub asset: AssetName,
    /// First settlement-layer block at which invocations are accepted; zero for no lower bound.
    pub start_block: u64,
    /// Last settlement-layer block at which invocations are accepted; zero for no upper bound.
    pub end_block: u64,
    /// Template-specific parameters, opaque to the runtime.
    pub content: SmallBlob,
}

impl ContractParams {
    pub fn check(&self) -> Result<(), ParamsError> {
        if self.end_block != 0 && self.end_block < self.start_block {
            return Err(ParamsError::InvalidWindow { start: self.start_block, end: self.end_block });
        }
        Ok(())
    }

    pub fn static_digest(&self) -> StaticDigest { self.commit_id() }

    /// Checks whether a settlement-layer height lies within the contract validity window.
    pub fn in_window(&self, height: u64) -> bool {
        height >= self.start_block && (self.end_block == 0 || height <= self.end_block)
    }

    pub fn is_expired_at(&self, height: u64) -> bool { self.end_block > 0 && height > self.end_block }
}

/// Contract locator: `<channel>_<asset>_<template>`.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(rename_all = "camelCase"))]
pub struct ContractUrl {
    pub channel: Address,
    pub asset: AssetName,
    pub template: TemplateName,
}

impl ContractUrl {
    pub fn new(channel: Address, params: &ContractParams) -> Self {
        Self { channel, asset: params.asset.clone(), template: params.template }
    }

    /// Path of the contract inside a channel: `<asset>_<template>`.
    pub fn relative_path(&self) -> String { format!("{}{URL_SEPARATOR}{}", self.asset, self.template) }

    /// Parses full or partial contract locators.
    ///
    /// Accepts `<channel>_<asset>_<template>`, `<asset>_<template>` and `<template>`.
    pub fn parse_partial(s: &str) -> Result<(Option<Address>, Option<AssetName>, TemplateName), ParamsError> {
        let parts = s.split(URL_SEPARATOR).collect::<Vec<_>>();
        match parts.as_slice() {
            [channel, asset, template] => {
                Ok((Some(channel.parse()?), Some(asset.parse()?), template.parse()?))
            }
            [asset, template] => Ok((None, Some(asset.parse()?), template.parse()?)),
            [template] => Ok((None, None, template.parse()?)),
            _ => Err(ParamsError::InvalidUrl(s.to_owned())),
        }
    }
}

impl Display for ContractUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{URL_SEPARATOR}{}{URL_SEPARATOR}{}", self.channel, self.asset, self.template)
    }
}

impl FromStr for ContractUrl {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Self::parse_partial(s)? {
            (Some(channel), Some(asset), template) => Ok(Self { channel, asset, template }),
            _ => Err(ParamsError::InvalidUrl(s.to_owned())),
        }
    }
}
