// This file is part of round-indexer.
// Copyright (C) 2025 Parlay Labs
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::{Bet, Claim, Epoch, MultiClaim, Round, validator::ValidatedEpoch};

/// Sqlx transaction for Postgres.
pub type SqlxTransaction = sqlx::Transaction<'static, sqlx::Postgres>;

/// The closed set of tables this system may touch. Every query names its table through this
/// enumeration; free-form table names never reach SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// Canonical per-epoch aggregates.
    Round,
    /// Historical bets.
    HisBet,
    /// Historical claims.
    HisClaim,
    /// Derived multi-claim markers.
    MultiClaim,
    /// Live-feed staging rows written by the real-time system; only ever deleted here.
    RealBet,
    /// Per-epoch completion markers.
    FinEpoch,
    /// Per-epoch failure diagnostics.
    ErrEpoch,
}

impl Table {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Round => "round",
            Self::HisBet => "hisbet",
            Self::HisClaim => "hisclaim",
            Self::MultiClaim => "multiclaim",
            Self::RealBet => "realbet",
            Self::FinEpoch => "finepoch",
            Self::ErrEpoch => "errepoch",
        }
    }
}

/// Everything that is persisted for one epoch in a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochCommit {
    pub round: Round,
    pub bets: Vec<Bet>,
    pub claims: Vec<Claim>,
    pub multi_claims: Vec<MultiClaim>,
}

impl From<ValidatedEpoch> for EpochCommit {
    fn from(validated: ValidatedEpoch) -> Self {
        Self {
            round: validated.round,
            bets: validated.bets,
            claims: validated.claims,
            multi_claims: validated.multi_claims,
        }
    }
}

/// Storage abstraction.
#[trait_variant::make(Send)]
pub trait Storage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Begin a transaction; committing is the caller's responsibility.
    async fn create_tx(&self) -> Result<SqlxTransaction, sqlx::Error>;

    /// Whether a completion marker exists for the given epoch.
    async fn epoch_completed(&self, epoch: Epoch) -> Result<bool, sqlx::Error>;

    /// Delete the live-feed staging rows of the given epoch.
    async fn delete_live_bets(
        &self,
        epoch: Epoch,
        tx: &mut SqlxTransaction,
    ) -> Result<u64, sqlx::Error>;

    async fn save_round(&self, round: &Round, tx: &mut SqlxTransaction)
    -> Result<(), sqlx::Error>;

    async fn save_bets(&self, bets: &[Bet], tx: &mut SqlxTransaction) -> Result<(), sqlx::Error>;

    async fn save_claims(
        &self,
        claims: &[Claim],
        tx: &mut SqlxTransaction,
    ) -> Result<(), sqlx::Error>;

    async fn save_multi_claims(
        &self,
        multi_claims: &[MultiClaim],
        tx: &mut SqlxTransaction,
    ) -> Result<(), sqlx::Error>;

    /// Append the completion marker of the given epoch.
    async fn mark_completed(
        &self,
        epoch: Epoch,
        tx: &mut SqlxTransaction,
    ) -> Result<(), sqlx::Error>;

    /// Persist one epoch atomically: delete the live-feed rows, insert the canonical records
    /// and append the completion marker, all in a single transaction. The marker cannot be
    /// separated from the records.
    async fn commit_epoch(&self, commit: &EpochCommit) -> Result<(), sqlx::Error>;

    /// Upsert the failure diagnostics of an epoch. Runs on a fresh connection, never inside a
    /// pipeline transaction, so diagnostics survive rollback.
    async fn record_epoch_error(&self, epoch: Epoch, message: &str) -> Result<(), sqlx::Error>;

    /// The persisted round of the given epoch, if any.
    async fn get_round(&self, epoch: Epoch) -> Result<Option<Round>, sqlx::Error>;

    /// The number of persisted bets of the given epoch.
    async fn count_bets(&self, epoch: Epoch) -> Result<u64, sqlx::Error>;
}

#[cfg(test)]
mod tests {
    use crate::domain::storage::Table;

    #[test]
    fn test_table_names() {
        let tables = [
            Table::Round,
            Table::HisBet,
            Table::HisClaim,
            Table::MultiClaim,
            Table::RealBet,
            Table::FinEpoch,
            Table::ErrEpoch,
        ];

        for table in tables {
            let name = table.as_str();
            assert!(!name.is_empty());
            assert!(name.chars().all(|c| c.is_ascii_lowercase()));
        }
    }
}
