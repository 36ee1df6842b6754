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

use core::error::Error;
use core::fmt::{self, Display, Formatter};
use core::str::FromStr;

use amplify::confinement::{NonEmptyBlob, TinyBlob};
use amplify::hex::FromHex;
use commit_verify::{Digest, Sha256};

use crate::{ParamsError, LIB_NAME_BIPACT};

const OP_0: u8 = 0x00;
const OP_2: u8 = 0x52;
const OP_CHECKMULTISIG: u8 = 0xae;
const COMPRESSED_PUBKEY_LEN: usize = 33;

/// Compressed secp256k1 public key of one of the two peers.
#[derive(Wrapper, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From, Display)]
#[wrapper(Deref, AsSlice, BorrowSlice, Hex)]
#[display(LowerHex)]
#[derive(StrictType, StrictDumb, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct PublicKey(TinyBlob);

impl PublicKey {
    pub fn from_slice(data: &[u8]) -> Result<Self, ParamsError> {
        if data.len() != COMPRESSED_PUBKEY_LEN || !matches!(data[0], 0x02 | 0x03) {
            return Err(ParamsError::InvalidAddress(format!("{data:02x?}")));
        }
        TinyBlob::try_from(data.to_vec())
            .map(Self)
            .map_err(|_| ParamsError::InvalidAddress(format!("{data:02x?}")))
    }
}

impl FromStr for PublicKey {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let data = Vec::<u8>::from_hex(s).map_err(|_| ParamsError::InvalidAddress(s.to_owned()))?;
        Self::from_slice(&data)
    }
}

#[derive(Wrapper, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, From, Display)]
#[wrapper(Deref, AsSlice, BorrowSlice, Hex)]
#[display(LowerHex)]
#[derive(StrictType, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct SigBlob(NonEmptyBlob<4096>);

impl Default for SigBlob {
    fn default() -> Self { SigBlob(NonEmptyBlob::with(0)) }
}

/// Wallet-side signer. Key storage lives outside of the runtime.
pub trait Signer {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, message: [u8; 32]) -> SigBlob;
}

pub trait SigValidator {
    /// Validates a signature over a 32-byte message digest made by the owner of `pubkey`.
    fn validate_sig(&self, message: impl Into<[u8; 32]>, pubkey: &PublicKey, sig: &SigBlob) -> Result<(), impl Error>;
}

/// Builds a 2-of-2 multisig redeem script from the keys of both peers.
///
/// Keys are sorted lexicographically, so both peers derive the same script independently of
/// which one is local.
pub fn multisig_redeem_script(a: &PublicKey, b: &PublicKey) -> Vec<u8> {
    let (first, second) = if a.as_slice() <= b.as_slice() { (a, b) } else { (b, a) };
    let mut script = Vec::with_capacity(3 + 2 * (COMPRESSED_PUBKEY_LEN + 1));
    script.push(OP_2);
    for key in [first, second] {
        script.push(key.len() as u8);
        script.extend_from_slice(key.as_slice());
    }
    script.push(OP_2);
    script.push(OP_CHECKMULTISIG);
    script
}

/// Pay-to-witness-script-hash output script for a redeem script.
pub fn p2wsh_script(redeem_script: &[u8]) -> Vec<u8> {
    let hash: [u8; 32] = Sha256::digest(redeem_script).into();
    let mut script = Vec::with_capacity(34);
    script.push(OP_0);
    script.push(32);
    script.extend_from_slice(&hash);
    script
}

pub(crate) struct ScriptHex<'a>(pub &'a [u8]);

impl Display for ScriptHex<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
