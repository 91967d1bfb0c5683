//! Raw validator data as reported by the chain node.
//!
//! `getVoteAccounts` returns loosely-typed JSON objects. Each object is parsed
//! independently so that one malformed entry only removes that validator from the
//! snapshot instead of failing the whole refresh.

use std::{collections::HashMap, str::FromStr};

use log::warn;
use serde_json::{Map, Value};
use solana_sdk::{
    clock::{Epoch, Slot},
    pubkey::Pubkey,
};
use thiserror::Error;

use crate::ErrorKind;

/// One `[epoch, cumulative_credits, previous_cumulative_credits]` entry of a vote
/// account's credit history. Serializes as a three element JSON array.
pub type EpochCredits = (Epoch, u64, u64);

/// Reasons a single vote-account record is excluded from the computation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("missing field `{0}`")]
    MissingField(&'static str),

    #[error("field `{field}` is not a valid {expected}: {value}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("commission {0} is outside 0..=100")]
    CommissionOutOfRange(u64),
}

impl RecordError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ComputeSkip
    }
}

/// A validator's vote account as returned by `getVoteAccounts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorRecord {
    pub identity_pubkey: String,
    pub vote_pubkey: String,
    /// Percent of rewards kept by the validator, 0..=100
    pub commission: u8,
    pub last_vote: Slot,
    pub root_slot: Slot,
    pub credits: u64,
    pub epoch_credits: Vec<EpochCredits>,
    /// Activated stake in lamports
    pub activated_stake: u64,
    /// Software version, when the record carries one
    pub version: Option<String>,
    /// Set from the RPC list the record came from, never from the record itself
    pub delinquent: bool,
}

impl ValidatorRecord {
    /// Parses one entry of the `current` or `delinquent` vote-account list.
    ///
    /// # Arguments
    /// * `value` - The raw JSON object from the RPC response
    /// * `delinquent` - Whether the entry came from the `delinquent` list
    ///
    /// # Returns
    /// The parsed record, or the first field that failed validation
    pub fn from_rpc(value: &Value, delinquent: bool) -> Result<Self, RecordError> {
        let obj = value.as_object().ok_or(RecordError::NotAnObject)?;

        let vote_pubkey = required_pubkey(obj, "votePubkey")?;
        let identity_pubkey = required_pubkey(obj, "nodePubkey")?;
        let activated_stake =
            optional_u64(obj, "activatedStake")?.ok_or(RecordError::MissingField("activatedStake"))?;

        let commission =
            optional_u64(obj, "commission")?.ok_or(RecordError::MissingField("commission"))?;
        if commission > 100 {
            return Err(RecordError::CommissionOutOfRange(commission));
        }

        let epoch_credits = match obj.get("epochCredits") {
            None | Some(Value::Null) => Vec::new(),
            Some(raw) => parse_epoch_credits(raw)?,
        };

        // getVoteAccounts has no `credits` field; fall back to the newest cumulative total
        let credits = match optional_u64(obj, "credits")? {
            Some(credits) => credits,
            None => epoch_credits.last().map(|(_, credits, _)| *credits).unwrap_or(0),
        };

        let version = match obj.get("version") {
            Some(Value::String(version)) if !version.is_empty() => Some(version.clone()),
            _ => None,
        };

        Ok(ValidatorRecord {
            identity_pubkey,
            vote_pubkey,
            commission: commission as u8,
            last_vote: optional_u64(obj, "lastVote")?.unwrap_or(0),
            root_slot: optional_u64(obj, "rootSlot")?.unwrap_or(0),
            credits,
            epoch_credits,
            activated_stake,
            version,
            delinquent,
        })
    }

    /// Parses a whole vote-account list, logging and dropping records that fail.
    pub fn parse_list(values: &[Value], delinquent: bool) -> Vec<ValidatorRecord> {
        values
            .iter()
            .filter_map(|value| match ValidatorRecord::from_rpc(value, delinquent) {
                Ok(record) => Some(record),
                Err(e) => {
                    let vote = value
                        .get("votePubkey")
                        .and_then(Value::as_str)
                        .unwrap_or("<unknown>");
                    warn!("skipping vote account {vote} ({}): {e}", e.kind());
                    None
                }
            })
            .collect()
    }
}

fn required_pubkey(obj: &Map<String, Value>, field: &'static str) -> Result<String, RecordError> {
    let raw = obj
        .get(field)
        .and_then(Value::as_str)
        .ok_or(RecordError::MissingField(field))?;
    Pubkey::from_str(raw).map_err(|_| RecordError::InvalidField {
        field,
        expected: "base58 pubkey",
        value: raw.to_string(),
    })?;
    Ok(raw.to_string())
}

fn optional_u64(obj: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, RecordError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value.as_u64().map(Some).ok_or_else(|| RecordError::InvalidField {
            field,
            expected: "unsigned integer",
            value: value.to_string(),
        }),
    }
}

fn parse_epoch_credits(raw: &Value) -> Result<Vec<EpochCredits>, RecordError> {
    let invalid = || RecordError::InvalidField {
        field: "epochCredits",
        expected: "list of [epoch, credits, previous_credits]",
        value: raw.to_string(),
    };
    raw.as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|entry| match entry.as_array().map(Vec::as_slice) {
            Some([epoch, credits, previous]) => Ok((
                epoch.as_u64().ok_or_else(invalid)?,
                credits.as_u64().ok_or_else(invalid)?,
                previous.as_u64().ok_or_else(invalid)?,
            )),
            _ => Err(invalid()),
        })
        .collect()
}

/// Leader slots assigned and blocks produced, keyed by identity pubkey.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockProductionTable(HashMap<String, (u64, u64)>);

impl BlockProductionTable {
    /// Builds the table from the `byIdentity` object of a `getBlockProduction` result.
    /// Entries that are not `[assigned, produced]` integer pairs are logged and dropped.
    pub fn from_by_identity(by_identity: &Value) -> Self {
        let Some(entries) = by_identity.as_object() else {
            warn!("block production byIdentity is not an object: {by_identity}");
            return Self::default();
        };
        let table = entries
            .iter()
            .filter_map(|(identity, pair)| {
                let parsed = match pair.as_array().map(Vec::as_slice) {
                    Some([assigned, produced]) => assigned.as_u64().zip(produced.as_u64()),
                    _ => None,
                };
                if parsed.is_none() {
                    warn!("dropping malformed block production entry for {identity}: {pair}");
                }
                parsed.map(|counts| (identity.clone(), counts))
            })
            .collect();
        BlockProductionTable(table)
    }

    /// Returns `(assigned_slots, produced_blocks)` for an identity, if it had leader slots.
    pub fn get(&self, identity: &str) -> Option<(u64, u64)> {
        self.0.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, (u64, u64))> for BlockProductionTable {
    fn from_iter<T: IntoIterator<Item = (String, (u64, u64))>>(iter: T) -> Self {
        BlockProductionTable(iter.into_iter().collect())
    }
}
