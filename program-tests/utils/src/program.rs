//! Ledger-side behavior of the typing program and the delegation flow.

use std::collections::HashMap;

use solana_sdk::{
    account::Account,
    instruction::InstructionError,
    pubkey::Pubkey,
    transaction::{Transaction, TransactionError},
};
use typing_sync_client::{
    accounts::{AnchorAccount, PersonalRecord, TypingAttempt, TypingSession},
    address::{derive_record_address, derive_session_address},
    constants::{DELEGATION_PROGRAM_ID, MAX_ATTEMPTS},
    errors::TypingProgramError,
    instructions::instruction_discriminator,
    rpc::Layer,
};

/// `8 + TypingSession::INIT_SPACE`
pub const SESSION_SPACE: usize = 8 + 32 + 4 + 4 + 4 + 2 + 1 + 1 + 8 + 9;
/// `8 + PersonalRecord::INIT_SPACE` with room for every attempt.
pub const RECORD_SPACE: usize = 8 + 32 + 4 + 8 + 8 + 2 + 1 + 4 + MAX_ATTEMPTS as usize * 35;
pub const ACCOUNT_LAMPORTS: u64 = 1_500_000;

/// Anchor's `ConstraintSeeds`.
const CONSTRAINT_SEEDS: u32 = 2006;
/// Anchor's `AccountOwnedByWrongProgram`.
const ACCOUNT_OWNED_BY_WRONG_PROGRAM: u32 = 3007;
/// Anchor's `AccountNotInitialized`.
const ACCOUNT_NOT_INITIALIZED: u32 = 3012;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTokenEntry {
    pub authority: Pubkey,
    pub signer: Pubkey,
    pub valid_until: i64,
}

/// Both layers' accounts plus what the program needs from the runtime.
#[derive(Debug, Default)]
pub struct LedgerAccounts {
    pub accounts: HashMap<(Layer, Pubkey), Account>,
    pub session_tokens: HashMap<Pubkey, SessionTokenEntry>,
    pub delegated_validators: HashMap<Pubkey, Option<Pubkey>>,
    pub unix_timestamp: i64,
}

fn custom(code: u32) -> TransactionError {
    TransactionError::InstructionError(0, InstructionError::Custom(code))
}

fn program_error(error: TypingProgramError) -> TransactionError {
    let code = match error {
        TypingProgramError::SessionNotActive => 6000,
        TypingProgramError::SessionAlreadyEnded => 6001,
        TypingProgramError::InvalidAuth => 6002,
        TypingProgramError::MaxAttemptsReached => 6003,
        TypingProgramError::SessionStillActive => 6004,
    };
    custom(code)
}

fn padded(mut data: Vec<u8>, space: usize) -> Vec<u8> {
    if data.len() < space {
        data.resize(space, 0);
    }
    data
}

pub fn session_account(session: &TypingSession, owner: Pubkey) -> Account {
    Account {
        lamports: ACCOUNT_LAMPORTS,
        data: padded(session.to_account_data(), SESSION_SPACE),
        owner,
        executable: false,
        rent_epoch: 0,
    }
}

pub fn record_account(record: &PersonalRecord, owner: Pubkey) -> Account {
    Account {
        lamports: ACCOUNT_LAMPORTS,
        data: padded(record.to_account_data(), RECORD_SPACE),
        owner,
        executable: false,
        rent_epoch: 0,
    }
}

/// One decoded instruction of a transaction.
struct Invocation {
    program_id: Pubkey,
    accounts: Vec<(Pubkey, bool)>,
    data: Vec<u8>,
}

impl Invocation {
    fn parse(transaction: &Transaction) -> Result<Self, TransactionError> {
        let message = &transaction.message;
        let instruction = message
            .instructions
            .first()
            .ok_or(TransactionError::InvalidAccountIndex)?;
        let key = |index: u8| {
            message
                .account_keys
                .get(index as usize)
                .copied()
                .ok_or(TransactionError::InvalidAccountIndex)
        };
        let program_id = key(instruction.program_id_index)?;
        let accounts = instruction
            .accounts
            .iter()
            .map(|index| Ok((key(*index)?, message.is_signer(*index as usize))))
            .collect::<Result<Vec<_>, TransactionError>>()?;
        Ok(Self {
            program_id,
            accounts,
            data: instruction.data.clone(),
        })
    }

    fn account(&self, index: usize) -> Result<Pubkey, TransactionError> {
        self.accounts
            .get(index)
            .map(|(key, _)| *key)
            .ok_or(TransactionError::InstructionError(
                0,
                InstructionError::NotEnoughAccountKeys,
            ))
    }

    fn signer(&self, index: usize) -> Result<Pubkey, TransactionError> {
        match self.accounts.get(index) {
            Some((key, true)) => Ok(*key),
            Some((_, false)) => Err(TransactionError::InstructionError(
                0,
                InstructionError::MissingRequiredSignature,
            )),
            None => Err(TransactionError::InstructionError(
                0,
                InstructionError::NotEnoughAccountKeys,
            )),
        }
    }
}

impl LedgerAccounts {
    fn session(
        &self,
        layer: Layer,
        address: &Pubkey,
        program_id: &Pubkey,
    ) -> Result<TypingSession, TransactionError> {
        let account = self.writable(layer, address)?;
        if account.owner != *program_id {
            return Err(custom(ACCOUNT_OWNED_BY_WRONG_PROGRAM));
        }
        TypingSession::try_from_account_data(&account.data)
            .map_err(|_| custom(ACCOUNT_NOT_INITIALIZED))
    }

    fn record(
        &self,
        layer: Layer,
        address: &Pubkey,
        program_id: &Pubkey,
    ) -> Result<PersonalRecord, TransactionError> {
        let account = self.writable(layer, address)?;
        if account.owner != *program_id {
            return Err(custom(ACCOUNT_OWNED_BY_WRONG_PROGRAM));
        }
        PersonalRecord::try_from_account_data(&account.data)
            .map_err(|_| custom(ACCOUNT_NOT_INITIALIZED))
    }

    /// The rollup only accepts writes to accounts delegated to it.
    fn writable(&self, layer: Layer, address: &Pubkey) -> Result<&Account, TransactionError> {
        match (layer, self.accounts.get(&(layer, *address))) {
            (_, Some(account)) => Ok(account),
            (Layer::Rollup, None) => Err(TransactionError::InvalidWritableAccount),
            (Layer::Base, None) => Err(custom(ACCOUNT_NOT_INITIALIZED)),
        }
    }

    fn put_session(&mut self, layer: Layer, address: Pubkey, session: &TypingSession, owner: Pubkey) {
        self.accounts
            .insert((layer, address), session_account(session, owner));
    }

    fn authorize(
        &self,
        session: &TypingSession,
        signer: Pubkey,
        token: Pubkey,
        program_id: &Pubkey,
    ) -> Result<(), TransactionError> {
        if token != *program_id {
            if let Some(entry) = self.session_tokens.get(&token) {
                if entry.authority == session.player
                    && entry.signer == signer
                    && self.unix_timestamp < entry.valid_until
                {
                    return Ok(());
                }
            }
        }
        if session.player == signer {
            Ok(())
        } else {
            Err(program_error(TypingProgramError::InvalidAuth))
        }
    }

    /// Applies `transaction` on `layer`. Returns the accounts it changed.
    pub fn process(
        &mut self,
        layer: Layer,
        transaction: &Transaction,
        program_id: &Pubkey,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        let invocation = Invocation::parse(transaction)?;
        if invocation.program_id != *program_id {
            return Err(TransactionError::InvalidProgramForExecution);
        }
        if invocation.data.len() < 8 {
            return Err(TransactionError::InstructionError(
                0,
                InstructionError::InvalidInstructionData,
            ));
        }
        let (discriminator, args) = invocation.data.split_at(8);
        let name = [
            "initialize",
            "init_personal_record",
            "type_word",
            "end_session",
            "save_to_record",
            "delegate",
            "commit",
            "undelegate",
        ]
        .into_iter()
        .find(|name| instruction_discriminator(name) == discriminator)
        .ok_or(TransactionError::InstructionError(
            0,
            InstructionError::InvalidInstructionData,
        ))?;

        match name {
            "initialize" => self.initialize(layer, &invocation, program_id),
            "init_personal_record" => self.init_personal_record(layer, &invocation, program_id),
            "type_word" => {
                let is_correct = match args.first() {
                    Some(0) => false,
                    Some(1) => true,
                    _ => {
                        return Err(TransactionError::InstructionError(
                            0,
                            InstructionError::InvalidInstructionData,
                        ))
                    }
                };
                self.type_word(layer, &invocation, program_id, is_correct)
            }
            "end_session" => self.end_session(layer, &invocation, program_id),
            "save_to_record" => self.save_to_record(layer, &invocation, program_id),
            "delegate" => self.delegate(layer, &invocation, program_id),
            "commit" => self.commit(layer, &invocation, program_id, false),
            _ => self.commit(layer, &invocation, program_id, true),
        }
    }

    fn initialize(
        &mut self,
        layer: Layer,
        invocation: &Invocation,
        program_id: &Pubkey,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        let address = invocation.account(0)?;
        let player = invocation.signer(1)?;
        if address != derive_session_address(&player, program_id) {
            return Err(custom(CONSTRAINT_SEEDS));
        }
        if let Some(existing) = self.accounts.get(&(layer, address)) {
            if existing.owner != *program_id {
                return Err(custom(ACCOUNT_OWNED_BY_WRONG_PROGRAM));
            }
        }
        let session = TypingSession {
            player,
            words_typed: 0,
            correct_words: 0,
            errors: 0,
            wpm: 0,
            accuracy: 0,
            is_active: true,
            started_at: self.unix_timestamp,
            ended_at: None,
        };
        self.put_session(layer, address, &session, *program_id);
        Ok(vec![(layer, address)])
    }

    fn init_personal_record(
        &mut self,
        layer: Layer,
        invocation: &Invocation,
        program_id: &Pubkey,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        let address = invocation.account(0)?;
        let player = invocation.signer(1)?;
        if address != derive_record_address(&player, program_id) {
            return Err(custom(CONSTRAINT_SEEDS));
        }
        let record = PersonalRecord {
            player,
            attempt_count: 0,
            total_words_typed: 0,
            total_correct_words: 0,
            best_wpm: 0,
            best_accuracy: 0,
            attempts: Vec::new(),
        };
        self.accounts
            .insert((layer, address), record_account(&record, *program_id));
        Ok(vec![(layer, address)])
    }

    fn type_word(
        &mut self,
        layer: Layer,
        invocation: &Invocation,
        program_id: &Pubkey,
        is_correct: bool,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        let address = invocation.account(0)?;
        let signer = invocation.signer(1)?;
        let mut session = self.session(layer, &address, program_id)?;
        self.authorize(&session, signer, invocation.account(2)?, program_id)?;
        if !session.is_active {
            return Err(program_error(TypingProgramError::SessionNotActive));
        }

        session.words_typed += 1;
        if is_correct {
            session.correct_words += 1;
        } else {
            session.errors += 1;
        }
        session.accuracy = (session.correct_words as f64 / session.words_typed as f64 * 100.0) as u8;
        self.put_session(layer, address, &session, *program_id);
        Ok(vec![(layer, address)])
    }

    fn end_session(
        &mut self,
        layer: Layer,
        invocation: &Invocation,
        program_id: &Pubkey,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        let address = invocation.account(0)?;
        let signer = invocation.signer(1)?;
        let mut session = self.session(layer, &address, program_id)?;
        self.authorize(&session, signer, invocation.account(2)?, program_id)?;
        if !session.is_active {
            return Err(program_error(TypingProgramError::SessionNotActive));
        }

        session.is_active = false;
        session.ended_at = Some(self.unix_timestamp);
        let duration = self.unix_timestamp - session.started_at;
        if duration > 0 {
            let minutes = duration as f64 / 60.0;
            session.wpm = (session.correct_words as f64 / minutes) as u16;
        }
        self.put_session(layer, address, &session, *program_id);
        Ok(vec![(layer, address)])
    }

    fn save_to_record(
        &mut self,
        layer: Layer,
        invocation: &Invocation,
        program_id: &Pubkey,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        let session_address = invocation.account(0)?;
        let record_address = invocation.account(1)?;
        invocation.signer(2)?;
        let session = self.session(layer, &session_address, program_id)?;
        let mut record = self.record(layer, &record_address, program_id)?;

        if session.is_active {
            return Err(program_error(TypingProgramError::SessionStillActive));
        }
        if record.attempt_count >= MAX_ATTEMPTS {
            return Err(program_error(TypingProgramError::MaxAttemptsReached));
        }

        let ended_at = session.ended_at.unwrap_or(0);
        record.attempts.push(TypingAttempt {
            attempt_number: record.attempt_count + 1,
            words_typed: session.words_typed,
            correct_words: session.correct_words,
            errors: session.errors,
            wpm: session.wpm,
            accuracy: session.accuracy,
            duration: ended_at - session.started_at,
            timestamp: ended_at,
        });
        record.attempt_count += 1;
        record.total_words_typed += u64::from(session.words_typed);
        record.total_correct_words += u64::from(session.correct_words);
        record.best_wpm = record.best_wpm.max(session.wpm);
        record.best_accuracy = record.best_accuracy.max(session.accuracy);

        self.accounts
            .insert((layer, record_address), record_account(&record, *program_id));
        Ok(vec![(layer, record_address)])
    }

    fn delegate(
        &mut self,
        layer: Layer,
        invocation: &Invocation,
        program_id: &Pubkey,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        if layer != Layer::Base {
            return Err(TransactionError::InvalidWritableAccount);
        }
        let payer = invocation.signer(0)?;
        let address = invocation.account(4)?;
        if address != derive_session_address(&payer, program_id) {
            return Err(custom(CONSTRAINT_SEEDS));
        }
        let validator = invocation.accounts.get(8).map(|(key, _)| *key);

        let base = self
            .accounts
            .get_mut(&(Layer::Base, address))
            .ok_or(custom(ACCOUNT_NOT_INITIALIZED))?;
        if base.owner != *program_id {
            return Err(custom(ACCOUNT_OWNED_BY_WRONG_PROGRAM));
        }
        base.owner = DELEGATION_PROGRAM_ID;
        let mut clone = base.clone();
        clone.owner = *program_id;
        self.accounts.insert((Layer::Rollup, address), clone);
        self.delegated_validators.insert(address, validator);
        Ok(vec![(Layer::Base, address), (Layer::Rollup, address)])
    }

    /// `commit` checkpoints the rollup state to the base layer; `undelegate`
    /// additionally returns ownership and evicts the rollup copy.
    fn commit(
        &mut self,
        layer: Layer,
        invocation: &Invocation,
        program_id: &Pubkey,
        undelegate: bool,
    ) -> Result<Vec<(Layer, Pubkey)>, TransactionError> {
        if layer != Layer::Rollup {
            return Err(custom(ACCOUNT_OWNED_BY_WRONG_PROGRAM));
        }
        let payer = invocation.signer(0)?;
        let address = invocation.account(1)?;
        if address != derive_session_address(&payer, program_id) {
            return Err(custom(CONSTRAINT_SEEDS));
        }
        let rollup = self
            .accounts
            .get(&(Layer::Rollup, address))
            .cloned()
            .ok_or(TransactionError::InvalidWritableAccount)?;

        let mut base = rollup;
        base.owner = if undelegate {
            *program_id
        } else {
            DELEGATION_PROGRAM_ID
        };
        self.accounts.insert((Layer::Base, address), base);
        if undelegate {
            self.accounts.remove(&(Layer::Rollup, address));
            self.delegated_validators.remove(&address);
        }
        Ok(vec![(Layer::Base, address), (Layer::Rollup, address)])
    }
}
