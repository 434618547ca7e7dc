use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::{hash::hash, pubkey::Pubkey};
use thiserror::Error;

use crate::constants::{ACCOUNT_DISCRIMINATOR_LEN, MAX_ATTEMPTS};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Account data too short: {len} bytes")]
    TooShort { len: usize },

    #[error("Unknown account discriminator {found:?}")]
    UnknownDiscriminator { found: [u8; 8] },

    #[error("Discriminator mismatch for {account}: expected {expected:?}, found {found:?}")]
    DiscriminatorMismatch {
        account: &'static str,
        expected: [u8; 8],
        found: [u8; 8],
    },

    #[error("Failed to deserialize {account}: {error}")]
    Borsh { account: &'static str, error: String },
}

/// Eight-byte prefix identifying an account type of the program.
pub fn account_discriminator(name: &str) -> [u8; 8] {
    let digest = hash(format!("account:{}", name).as_bytes());
    let mut discriminator = [0u8; ACCOUNT_DISCRIMINATOR_LEN];
    discriminator.copy_from_slice(&digest.to_bytes()[..ACCOUNT_DISCRIMINATOR_LEN]);
    discriminator
}

fn split_discriminator(data: &[u8]) -> Result<([u8; 8], &[u8]), DecodeError> {
    if data.len() < ACCOUNT_DISCRIMINATOR_LEN {
        return Err(DecodeError::TooShort { len: data.len() });
    }
    let mut found = [0u8; ACCOUNT_DISCRIMINATOR_LEN];
    found.copy_from_slice(&data[..ACCOUNT_DISCRIMINATOR_LEN]);
    Ok((found, &data[ACCOUNT_DISCRIMINATOR_LEN..]))
}

/// Account schema: discriminator followed by the borsh body. Accounts are
/// allocated at their maximum size, so trailing bytes are ignored.
pub trait AnchorAccount: BorshDeserialize + BorshSerialize + Sized {
    const NAME: &'static str;

    fn discriminator() -> [u8; 8] {
        account_discriminator(Self::NAME)
    }

    fn try_from_account_data(data: &[u8]) -> Result<Self, DecodeError> {
        let (found, mut body) = split_discriminator(data)?;
        let expected = Self::discriminator();
        if found != expected {
            return Err(DecodeError::DiscriminatorMismatch {
                account: Self::NAME,
                expected,
                found,
            });
        }
        Self::deserialize(&mut body).map_err(|e| DecodeError::Borsh {
            account: Self::NAME,
            error: e.to_string(),
        })
    }

    fn to_account_data(&self) -> Vec<u8> {
        let mut data = Self::discriminator().to_vec();
        // Writing into a Vec cannot fail.
        let _ = self.serialize(&mut data);
        data
    }
}

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct TypingSession {
    pub player: Pubkey,
    pub words_typed: u32,
    pub correct_words: u32,
    pub errors: u32,
    pub wpm: u16,
    /// 0-100
    pub accuracy: u8,
    pub is_active: bool,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl AnchorAccount for TypingSession {
    const NAME: &'static str = "TypingSession";
}

impl TypingSession {
    /// `ended_at` is set exactly when the session was ended, and the word
    /// tallies never exceed the number of words typed.
    pub fn is_consistent(&self) -> bool {
        let tallies = u64::from(self.correct_words) + u64::from(self.errors);
        tallies <= u64::from(self.words_typed) && self.ended_at.is_some() == !self.is_active
    }

    pub fn duration(&self) -> Option<i64> {
        self.ended_at.map(|ended_at| ended_at - self.started_at)
    }
}

#[derive(BorshSerialize, BorshDeserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypingAttempt {
    pub attempt_number: u32,
    pub words_typed: u32,
    pub correct_words: u32,
    pub errors: u32,
    pub wpm: u16,
    pub accuracy: u8,
    pub duration: i64,
    pub timestamp: i64,
}

#[derive(BorshSerialize, BorshDeserialize, Clone, Debug, PartialEq, Eq)]
pub struct PersonalRecord {
    pub player: Pubkey,
    pub attempt_count: u32,
    pub total_words_typed: u64,
    pub total_correct_words: u64,
    pub best_wpm: u16,
    pub best_accuracy: u8,
    pub attempts: Vec<TypingAttempt>,
}

impl AnchorAccount for PersonalRecord {
    const NAME: &'static str = "PersonalRecord";
}

impl PersonalRecord {
    pub fn is_full(&self) -> bool {
        self.attempt_count >= MAX_ATTEMPTS
    }

    pub fn latest_attempt(&self) -> Option<&TypingAttempt> {
        self.attempts.last()
    }
}

/// Any account the client tracks, decoded by its discriminator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackedAccount {
    Session(TypingSession),
    Record(PersonalRecord),
}

impl TrackedAccount {
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let (found, _) = split_discriminator(data)?;
        if found == TypingSession::discriminator() {
            TypingSession::try_from_account_data(data).map(Self::Session)
        } else if found == PersonalRecord::discriminator() {
            PersonalRecord::try_from_account_data(data).map(Self::Record)
        } else {
            Err(DecodeError::UnknownDiscriminator { found })
        }
    }

    pub fn as_session(&self) -> Option<&TypingSession> {
        match self {
            Self::Session(session) => Some(session),
            Self::Record(_) => None,
        }
    }

    pub fn as_record(&self) -> Option<&PersonalRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Session(_) => None,
        }
    }

    pub fn player(&self) -> Pubkey {
        match self {
            Self::Session(session) => session.player,
            Self::Record(record) => record.player,
        }
    }

    pub fn to_account_data(&self) -> Vec<u8> {
        match self {
            Self::Session(session) => session.to_account_data(),
            Self::Record(record) => record.to_account_data(),
        }
    }
}

impl From<TypingSession> for TrackedAccount {
    fn from(session: TypingSession) -> Self {
        Self::Session(session)
    }
}

impl From<PersonalRecord> for TrackedAccount {
    fn from(record: PersonalRecord) -> Self {
        Self::Record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> TypingSession {
        TypingSession {
            player: Pubkey::new_unique(),
            words_typed: 4,
            correct_words: 3,
            errors: 1,
            wpm: 0,
            accuracy: 75,
            is_active: true,
            started_at: 1_700_000_000,
            ended_at: None,
        }
    }

    #[test]
    fn session_layout_matches_program_allocation() {
        // 8 discriminator + 32 + 4 + 4 + 4 + 2 + 1 + 1 + 8 + (1 + 8)
        let expected = session();
        let mut data = expected.to_account_data();
        assert_eq!(data.len(), 8 + 32 + 4 + 4 + 4 + 2 + 1 + 1 + 8 + 1);

        // Allocated space includes the `Some` payload; zero padding must decode.
        data.extend_from_slice(&[0u8; 8]);
        assert_eq!(TypingSession::try_from_account_data(&data).unwrap(), expected);
    }

    #[test]
    fn tracked_account_dispatches_on_discriminator() {
        let record = PersonalRecord {
            player: Pubkey::new_unique(),
            attempt_count: 1,
            total_words_typed: 10,
            total_correct_words: 9,
            best_wpm: 40,
            best_accuracy: 90,
            attempts: vec![TypingAttempt {
                attempt_number: 1,
                words_typed: 10,
                correct_words: 9,
                errors: 1,
                wpm: 40,
                accuracy: 90,
                duration: 15,
                timestamp: 1_700_000_015,
            }],
        };
        let decoded = TrackedAccount::decode(&record.to_account_data()).unwrap();
        assert_eq!(decoded.as_record(), Some(&record));
        assert_eq!(decoded.player(), record.player);

        let decoded = TrackedAccount::decode(&session().to_account_data()).unwrap();
        assert!(decoded.as_session().is_some());
    }

    #[test]
    fn decode_failures_are_typed() {
        assert_eq!(
            TrackedAccount::decode(&[1, 2, 3]),
            Err(DecodeError::TooShort { len: 3 })
        );
        assert!(matches!(
            TrackedAccount::decode(&[7u8; 64]),
            Err(DecodeError::UnknownDiscriminator { .. })
        ));
        let record_bytes = PersonalRecord::discriminator().to_vec();
        assert!(matches!(
            TypingSession::try_from_account_data(&record_bytes),
            Err(DecodeError::DiscriminatorMismatch { .. })
        ));
        let truncated = TypingSession::discriminator().to_vec();
        assert!(matches!(
            TypingSession::try_from_account_data(&truncated),
            Err(DecodeError::Borsh { .. })
        ));
    }

    #[test]
    fn consistency_check() {
        let mut s = session();
        assert!(s.is_consistent());
        s.errors = 2;
        assert!(!s.is_consistent());
        s.errors = 1;
        s.is_active = false;
        assert!(!s.is_consistent());
        s.ended_at = Some(s.started_at + 60);
        assert!(s.is_consistent());
        assert_eq!(s.duration(), Some(60));
    }
}
