//! Deterministic program-derived addresses for a player.
//!
//! Nothing here touches the network and nothing is random: the same owner and
//! program id always map to the same addresses, across process restarts.

use std::str::FromStr;

use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::constants::{
    DELEGATE_BUFFER_SEED, DELEGATION_METADATA_SEED, DELEGATION_PROGRAM_ID,
    DELEGATION_RECORD_SEED, PERSONAL_RECORD_SEED,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid owner identity `{input}`: {error}")]
    InvalidOwner { input: String, error: String },
}

/// Derives `seeds = [salts.., owner]` under `program_id`.
pub fn derive_address(owner: &Pubkey, salts: &[&[u8]], program_id: &Pubkey) -> Pubkey {
    let mut seeds: Vec<&[u8]> = Vec::with_capacity(salts.len() + 1);
    seeds.extend_from_slice(salts);
    seeds.push(owner.as_ref());
    Pubkey::find_program_address(&seeds, program_id).0
}

pub fn parse_owner(input: &str) -> Result<Pubkey, AddressError> {
    Pubkey::from_str(input.trim()).map_err(|e| AddressError::InvalidOwner {
        input: input.to_string(),
        error: e.to_string(),
    })
}

/// Session address: the owner is the only seed.
pub fn derive_session_address(owner: &Pubkey, program_id: &Pubkey) -> Pubkey {
    derive_address(owner, &[], program_id)
}

/// Record address: `[b"personal_record", owner]`.
pub fn derive_record_address(owner: &Pubkey, program_id: &Pubkey) -> Pubkey {
    derive_address(owner, &[PERSONAL_RECORD_SEED], program_id)
}

/// The two addresses tracked for one player, derived once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedAddresses {
    pub owner: Pubkey,
    pub program_id: Pubkey,
    pub session: Pubkey,
    pub record: Pubkey,
}

impl TrackedAddresses {
    pub fn new(owner: Pubkey, program_id: Pubkey) -> Self {
        Self {
            owner,
            program_id,
            session: derive_session_address(&owner, &program_id),
            record: derive_record_address(&owner, &program_id),
        }
    }

    pub fn from_owner_str(owner: &str, program_id: Pubkey) -> Result<Self, AddressError> {
        Ok(Self::new(parse_owner(owner)?, program_id))
    }

    pub fn all(&self) -> [Pubkey; 2] {
        [self.session, self.record]
    }
}

/// Accounts the delegation program requires alongside the delegated account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationAccounts {
    pub buffer: Pubkey,
    pub delegation_record: Pubkey,
    pub delegation_metadata: Pubkey,
}

impl DelegationAccounts {
    pub fn for_account(delegated: &Pubkey, owner_program: &Pubkey) -> Self {
        Self {
            buffer: Pubkey::find_program_address(
                &[DELEGATE_BUFFER_SEED, delegated.as_ref()],
                owner_program,
            )
            .0,
            delegation_record: Pubkey::find_program_address(
                &[DELEGATION_RECORD_SEED, delegated.as_ref()],
                &DELEGATION_PROGRAM_ID,
            )
            .0,
            delegation_metadata: Pubkey::find_program_address(
                &[DELEGATION_METADATA_SEED, delegated.as_ref()],
                &DELEGATION_PROGRAM_ID,
            )
            .0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TYPING_PROGRAM_ID;

    #[test]
    fn derivation_is_deterministic() {
        let owner = Pubkey::new_unique();
        let first = TrackedAddresses::new(owner, TYPING_PROGRAM_ID);
        let second = TrackedAddresses::new(owner, TYPING_PROGRAM_ID);
        assert_eq!(first, second);
        assert_ne!(first.session, first.record);
    }

    #[test]
    fn session_address_matches_single_seed_pda() {
        let owner = Pubkey::new_unique();
        let (expected, _) = Pubkey::find_program_address(&[owner.as_ref()], &TYPING_PROGRAM_ID);
        assert_eq!(derive_session_address(&owner, &TYPING_PROGRAM_ID), expected);

        let (expected, _) = Pubkey::find_program_address(
            &[PERSONAL_RECORD_SEED, owner.as_ref()],
            &TYPING_PROGRAM_ID,
        );
        assert_eq!(derive_record_address(&owner, &TYPING_PROGRAM_ID), expected);
    }

    #[test]
    fn different_owners_never_collide() {
        let a = TrackedAddresses::new(Pubkey::new_unique(), TYPING_PROGRAM_ID);
        let b = TrackedAddresses::new(Pubkey::new_unique(), TYPING_PROGRAM_ID);
        assert_ne!(a.session, b.session);
        assert_ne!(a.record, b.record);
    }

    #[test]
    fn malformed_owner_is_rejected() {
        let err = TrackedAddresses::from_owner_str("not-a-key", TYPING_PROGRAM_ID).unwrap_err();
        assert!(matches!(err, AddressError::InvalidOwner { .. }));

        let owner = Pubkey::new_unique();
        let parsed = TrackedAddresses::from_owner_str(&format!(" {} ", owner), TYPING_PROGRAM_ID)
            .unwrap();
        assert_eq!(parsed.owner, owner);
    }
}
