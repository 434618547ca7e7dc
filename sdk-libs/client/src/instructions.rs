//! Instruction builders for the typing-session program.
//!
//! Only what is needed to route a call: the Anchor sighash, the arguments and
//! the account list each handler declares, including the fixed delegation
//! accounts.

use std::fmt::{Display, Formatter};

use solana_sdk::{
    hash::hash,
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
};
use thiserror::Error;

use crate::{
    address::{DelegationAccounts, TrackedAddresses},
    constants::{
        DELEGATION_PROGRAM_ID, MAGIC_CONTEXT_ID, MAGIC_PROGRAM_ID, SYSTEM_PROGRAM_ID,
    },
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("{call} must be signed by the owner {owner}, got {signer}")]
    SignerNotOwner {
        call: RemoteCall,
        owner: Pubkey,
        signer: Pubkey,
    },

    #[error("{call} requires account {address} ({name}) which does not exist yet")]
    MissingAccount {
        call: RemoteCall,
        name: &'static str,
        address: Pubkey,
    },

    #[error("{call} rejected before submission: {reason}")]
    Precondition { call: RemoteCall, reason: String },
}

/// Which credentials may sign a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignerPolicy {
    WalletOnly,
    /// The program accepts either the owner or a valid session token.
    WalletOrSession,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCall {
    InitializeSession,
    InitializeRecord,
    RecordWord { is_correct: bool },
    EndSession,
    SaveToRecord,
    Delegate,
    Commit,
    Undelegate,
}

impl Display for RemoteCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.instruction_name())
    }
}

pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let digest = hash(format!("global:{}", name).as_bytes());
    let mut discriminator = [0u8; 8];
    discriminator.copy_from_slice(&digest.to_bytes()[..8]);
    discriminator
}

/// Everything a builder needs besides the call itself.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub addresses: &'a TrackedAddresses,
    pub signer: Pubkey,
    pub session_token: Option<Pubkey>,
    pub rollup_validator: Option<Pubkey>,
}

impl RemoteCall {
    pub fn instruction_name(&self) -> &'static str {
        match self {
            RemoteCall::InitializeSession => "initialize",
            RemoteCall::InitializeRecord => "init_personal_record",
            RemoteCall::RecordWord { .. } => "type_word",
            RemoteCall::EndSession => "end_session",
            RemoteCall::SaveToRecord => "save_to_record",
            RemoteCall::Delegate => "delegate",
            RemoteCall::Commit => "commit",
            RemoteCall::Undelegate => "undelegate",
        }
    }

    pub fn signer_policy(&self) -> SignerPolicy {
        match self {
            RemoteCall::RecordWord { .. } | RemoteCall::EndSession => SignerPolicy::WalletOrSession,
            _ => SignerPolicy::WalletOnly,
        }
    }

    /// The address whose writes must not overlap.
    pub fn write_target(&self, addresses: &TrackedAddresses) -> Pubkey {
        match self {
            RemoteCall::InitializeRecord => addresses.record,
            _ => addresses.session,
        }
    }

    /// Accounts re-read after the call is confirmed.
    pub fn affected_accounts(&self, addresses: &TrackedAddresses) -> Vec<Pubkey> {
        match self {
            RemoteCall::InitializeRecord => vec![addresses.record],
            RemoteCall::SaveToRecord => vec![addresses.session, addresses.record],
            _ => vec![addresses.session],
        }
    }

    pub fn data(&self) -> Vec<u8> {
        let mut data = instruction_discriminator(self.instruction_name()).to_vec();
        if let RemoteCall::RecordWord { is_correct } = self {
            data.push(u8::from(*is_correct));
        }
        data
    }

    pub fn build(&self, ctx: &CallContext<'_>) -> Result<Instruction, BuildError> {
        let addresses = ctx.addresses;
        let program_id = addresses.program_id;

        if self.signer_policy() == SignerPolicy::WalletOnly && ctx.signer != addresses.owner {
            return Err(BuildError::SignerNotOwner {
                call: *self,
                owner: addresses.owner,
                signer: ctx.signer,
            });
        }

        let accounts = match self {
            RemoteCall::InitializeSession => vec![
                AccountMeta::new(addresses.session, false),
                AccountMeta::new(ctx.signer, true),
                AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
            ],
            RemoteCall::InitializeRecord => vec![
                AccountMeta::new(addresses.record, false),
                AccountMeta::new(ctx.signer, true),
                AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
            ],
            RemoteCall::RecordWord { .. } | RemoteCall::EndSession => vec![
                AccountMeta::new(addresses.session, false),
                AccountMeta::new(ctx.signer, true),
                // Absent optional accounts are passed as the program id.
                AccountMeta::new_readonly(ctx.session_token.unwrap_or(program_id), false),
            ],
            RemoteCall::SaveToRecord => vec![
                AccountMeta::new(addresses.session, false),
                AccountMeta::new(addresses.record, false),
                AccountMeta::new(ctx.signer, true),
            ],
            RemoteCall::Delegate => {
                let delegation = DelegationAccounts::for_account(&addresses.session, &program_id);
                let mut accounts = vec![
                    AccountMeta::new(ctx.signer, true),
                    AccountMeta::new(delegation.buffer, false),
                    AccountMeta::new(delegation.delegation_record, false),
                    AccountMeta::new(delegation.delegation_metadata, false),
                    AccountMeta::new(addresses.session, false),
                    AccountMeta::new_readonly(program_id, false),
                    AccountMeta::new_readonly(DELEGATION_PROGRAM_ID, false),
                    AccountMeta::new_readonly(SYSTEM_PROGRAM_ID, false),
                ];
                if let Some(validator) = ctx.rollup_validator {
                    accounts.push(AccountMeta::new_readonly(validator, false));
                }
                accounts
            }
            RemoteCall::Commit | RemoteCall::Undelegate => vec![
                AccountMeta::new(ctx.signer, true),
                AccountMeta::new(addresses.session, false),
                AccountMeta::new_readonly(MAGIC_PROGRAM_ID, false),
                AccountMeta::new(MAGIC_CONTEXT_ID, false),
            ],
        };

        Ok(Instruction {
            program_id,
            accounts,
            data: self.data(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TYPING_PROGRAM_ID;

    fn addresses() -> TrackedAddresses {
        TrackedAddresses::new(Pubkey::new_unique(), TYPING_PROGRAM_ID)
    }

    fn ctx(addresses: &TrackedAddresses, signer: Pubkey) -> CallContext<'_> {
        CallContext {
            addresses,
            signer,
            session_token: None,
            rollup_validator: None,
        }
    }

    #[test]
    fn record_word_encodes_flag() {
        let correct = RemoteCall::RecordWord { is_correct: true }.data();
        let wrong = RemoteCall::RecordWord { is_correct: false }.data();
        assert_eq!(&correct[..8], &instruction_discriminator("type_word"));
        assert_eq!(correct[8], 1);
        assert_eq!(wrong[8], 0);
        assert_eq!(RemoteCall::Commit.data().len(), 8);
    }

    #[test]
    fn session_key_may_sign_word_records() {
        let addresses = addresses();
        let session_signer = Pubkey::new_unique();
        let token = Pubkey::new_unique();
        let mut ctx = ctx(&addresses, session_signer);
        ctx.session_token = Some(token);

        let ix = RemoteCall::RecordWord { is_correct: true }.build(&ctx).unwrap();
        assert_eq!(ix.accounts[0].pubkey, addresses.session);
        assert_eq!(ix.accounts[1].pubkey, session_signer);
        assert!(ix.accounts[1].is_signer);
        assert_eq!(ix.accounts[2].pubkey, token);

        ctx.session_token = None;
        let ix = RemoteCall::EndSession.build(&ctx).unwrap();
        assert_eq!(ix.accounts[2].pubkey, TYPING_PROGRAM_ID);
    }

    #[test]
    fn wallet_only_calls_reject_foreign_signers() {
        let addresses = addresses();
        let err = RemoteCall::Delegate
            .build(&ctx(&addresses, Pubkey::new_unique()))
            .unwrap_err();
        assert!(matches!(err, BuildError::SignerNotOwner { .. }));
    }

    #[test]
    fn delegate_carries_delegation_accounts() {
        let addresses = addresses();
        let validator = Pubkey::new_unique();
        let mut ctx = ctx(&addresses, addresses.owner);
        ctx.rollup_validator = Some(validator);
        let ix = RemoteCall::Delegate.build(&ctx).unwrap();
        let delegation = DelegationAccounts::for_account(&addresses.session, &TYPING_PROGRAM_ID);
        let keys: Vec<Pubkey> = ix.accounts.iter().map(|meta| meta.pubkey).collect();
        assert_eq!(
            keys,
            vec![
                addresses.owner,
                delegation.buffer,
                delegation.delegation_record,
                delegation.delegation_metadata,
                addresses.session,
                TYPING_PROGRAM_ID,
                DELEGATION_PROGRAM_ID,
                SYSTEM_PROGRAM_ID,
                validator,
            ]
        );
    }

    #[test]
    fn commit_and_undelegate_route_through_magic_program() {
        let addresses = addresses();
        for call in [RemoteCall::Commit, RemoteCall::Undelegate] {
            let ix = call.build(&ctx(&addresses, addresses.owner)).unwrap();
            assert_eq!(ix.accounts[2].pubkey, MAGIC_PROGRAM_ID);
            assert_eq!(ix.accounts[3].pubkey, MAGIC_CONTEXT_ID);
            assert_eq!(call.signer_policy(), SignerPolicy::WalletOnly);
        }
        assert_ne!(
            instruction_discriminator("commit"),
            instruction_discriminator("undelegate")
        );
    }

    #[test]
    fn save_touches_both_accounts() {
        let addresses = addresses();
        assert_eq!(
            RemoteCall::SaveToRecord.affected_accounts(&addresses),
            vec![addresses.session, addresses.record]
        );
        assert_eq!(
            RemoteCall::InitializeRecord.write_target(&addresses),
            addresses.record
        );
    }
}
