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

use crate::LIB_NAME_BIPACT;

/// Lifecycle status of a contract instance.
///
/// Values are ordered: terminated states are negative, [`Self::INIT`] is zero, the operational
/// range starts with [`Self::READY`] and includes template-private adjusting states, and
/// [`Self::CLOSING`] is the last non-terminal state.
#[derive(Wrapper, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, From)]
#[wrapper(Deref)]
#[derive(StrictType, StrictEncode, StrictDecode)]
#[strict_type(lib = LIB_NAME_BIPACT)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct ContractStatus(i16);

impl ContractStatus {
    pub const EXPIRED: Self = Self(-2);
    pub const CLOSED: Self = Self(-1);
    pub const INIT: Self = Self(0);
    pub const READY: Self = Self(100);
    pub const ADJUSTING_FIRST: Self = Self(101);
    pub const ADJUSTING_LAST: Self = Self(199);
    pub const CLOSING: Self = Self(200);

    /// Constructs a template-private adjusting status. Codes must be in `1..=99` range.
    pub const fn adjusting(code: u8) -> Option<Self> {
        if code == 0 || code > 99 {
            return None;
        }
        Some(Self(100 + code as i16))
    }

    pub fn to_i16(self) -> i16 { self.0 }

    pub fn is_terminated(self) -> bool { self.0 < 0 }
    pub fn is_adjusting(self) -> bool { self >= Self::ADJUSTING_FIRST && self <= Self::ADJUSTING_LAST }
    pub fn is_operational(self) -> bool { self >= Self::READY && self < Self::CLOSING }

    /// Checks whether a lifecycle transition from `self` to `next` is allowed.
    ///
    /// READY is reachable only from INIT (install completion) and from the adjusting range; the
    /// lifecycle never returns to INIT and terminated states are final.
    pub fn can_transit(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        match self {
            s if s.is_terminated() => false,
            Self::INIT => next == Self::READY || next == Self::CLOSED,
            s if s.is_operational() => next.is_operational() || next == Self::CLOSING,
            Self::CLOSING => next == Self::CLOSED || next == Self::EXPIRED,
            _ => false,
        }
    }
}

impl Display for ContractStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match *self {
            Self::EXPIRED => f.write_str("expired"),
            Self::CLOSED => f.write_str("closed"),
            Self::INIT => f.write_str("init"),
            Self::READY => f.write_str("ready"),
            Self::CLOSING => f.write_str("closing"),
            s if s.is_adjusting() => write!(f, "adjusting({})", s.0),
            s => write!(f, "unknown({})", s.0),
        }
    }
}

#[cfg(test)]
mod test {
    #![cfg_attr(coverage_nightly, coverage(off))]

    use super::*;

    #[test]
    fn ranges() {
        assert!(ContractStatus::READY.is_operational());
        assert!(ContractStatus::adjusting(1).unwrap().is_operational());
        assert!(ContractStatus::adjusting(99).unwrap().is_adjusting());
        assert_eq!(ContractStatus::adjusting(0), None);
        assert_eq!(ContractStatus::adjusting(100), None);
        assert!(!ContractStatus::CLOSING.is_operational());
        assert!(!ContractStatus::INIT.is_operational());
        assert!(ContractStatus::CLOSED.is_terminated());
        assert!(ContractStatus::EXPIRED.is_terminated());
    }

    #[test]
    fn transitions() {
        let adj = ContractStatus::adjusting(1).unwrap();
        assert!(ContractStatus::INIT.can_transit(ContractStatus::READY));
        assert!(ContractStatus::READY.can_transit(adj));
        assert!(adj.can_transit(ContractStatus::READY));
        assert!(adj.can_transit(ContractStatus::CLOSING));
        assert!(ContractStatus::CLOSING.can_transit(ContractStatus::EXPIRED));
        assert!(!ContractStatus::READY.can_transit(ContractStatus::INIT));
        assert!(!ContractStatus::CLOSED.can_transit(ContractStatus::READY));
        assert!(!ContractStatus::CLOSING.can_transit(ContractStatus::READY));
    }

    #[test]
    fn display() {
        assert_eq!(ContractStatus::READY.to_string(), "ready");
        assert_eq!(ContractStatus::adjusting(1).unwrap().to_string(), "adjusting(101)");
    }
}
