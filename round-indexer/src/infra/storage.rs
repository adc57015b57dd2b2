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

use crate::domain::{
    Amount, Bet, Claim, Epoch, MultiClaim, Odds, Price, Round, RoundOutcome,
    storage::{EpochCommit, SqlxTransaction, Storage, Table},
};
use fastrace::trace;
use indexer_common::infra::pool::postgres::PostgresPool;
use indoc::indoc;
use sqlx::{Postgres, QueryBuilder, Row, postgres::PgRow};
use std::str::FromStr;

/// Postgres based implementation of [Storage].
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PostgresPool,
}

impl PostgresStorage {
    /// Create a new [PostgresStorage].
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

impl Storage for PostgresStorage {
    #[trace]
    async fn create_tx(&self) -> Result<SqlxTransaction, sqlx::Error> {
        self.pool.begin().await
    }

    #[trace]
    async fn epoch_completed(&self, epoch: Epoch) -> Result<bool, sqlx::Error> {
        let query = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE epoch = $1)",
            Table::FinEpoch.as_str()
        );

        sqlx::query_scalar::<_, bool>(&query)
            .bind(epoch as i64)
            .fetch_one(&*self.pool)
            .await
    }

    #[trace]
    async fn delete_live_bets(
        &self,
        epoch: Epoch,
        tx: &mut SqlxTransaction,
    ) -> Result<u64, sqlx::Error> {
        let query = format!(
            "DELETE FROM {} WHERE epoch = $1",
            Table::RealBet.as_str()
        );

        let result = sqlx::query(&query)
            .bind(epoch as i64)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected())
    }

    #[trace]
    async fn save_round(
        &self,
        round: &Round,
        tx: &mut SqlxTransaction,
    ) -> Result<(), sqlx::Error> {
        let query = format!(
            indoc! {"
                INSERT INTO {} (
                    epoch,
                    start_time,
                    lock_time,
                    close_time,
                    lock_price,
                    close_price,
                    outcome,
                    total_amount,
                    up_amount,
                    down_amount,
                    up_odds,
                    down_odds
                )
                VALUES (
                    $1, $2, $3, $4,
                    $5::numeric, $6::numeric, $7,
                    $8::numeric, $9::numeric, $10::numeric, $11::numeric, $12::numeric
                )
            "},
            Table::Round.as_str()
        );

        sqlx::query(&query)
            .bind(round.epoch as i64)
            .bind(round.start_time)
            .bind(round.lock_time)
            .bind(round.close_time)
            .bind(round.lock_price.map(|price| price.to_string()))
            .bind(round.close_price.map(|price| price.to_string()))
            .bind(round.outcome.as_str())
            .bind(round.total_amount.to_string())
            .bind(round.up_amount.to_string())
            .bind(round.down_amount.to_string())
            .bind(round.up_odds.to_string())
            .bind(round.down_odds.to_string())
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn save_bets(&self, bets: &[Bet], tx: &mut SqlxTransaction) -> Result<(), sqlx::Error> {
        if bets.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Postgres>::new(format!(
            indoc! {"
                INSERT INTO {} (
                    epoch, tx_hash, log_index, bet_time, sender,
                    direction, amount, outcome, block_height
                )
            "},
            Table::HisBet.as_str()
        ));

        query.push_values(bets, |mut row, bet| {
            row.push_bind(bet.epoch as i64)
                .push_bind(format!("{:#x}", bet.tx_hash))
                .push_bind(bet.log_index as i64)
                .push_bind(bet.bet_time)
                .push_bind(bet.sender.as_str().to_owned())
                .push_bind(bet.direction.as_str())
                .push_bind(bet.amount.to_string())
                .push_unseparated("::numeric")
                .push_bind(bet.outcome.as_str())
                .push_bind(bet.block_height as i64);
        });
        query.push(" ON CONFLICT (tx_hash, log_index) DO NOTHING");

        query.build().execute(&mut **tx).await?;

        Ok(())
    }

    #[trace]
    async fn save_claims(
        &self,
        claims: &[Claim],
        tx: &mut SqlxTransaction,
    ) -> Result<(), sqlx::Error> {
        if claims.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Postgres>::new(format!(
            indoc! {"
                INSERT INTO {} (
                    epoch, bet_epoch, tx_hash, log_index, claim_time, sender, amount
                )
            "},
            Table::HisClaim.as_str()
        ));

        query.push_values(claims, |mut row, claim| {
            row.push_bind(claim.epoch as i64)
                .push_bind(claim.bet_epoch as i64)
                .push_bind(format!("{:#x}", claim.tx_hash))
                .push_bind(claim.log_index as i64)
                .push_bind(claim.claim_time)
                .push_bind(claim.sender.as_str().to_owned())
                .push_bind(claim.amount.to_string())
                .push_unseparated("::numeric");
        });
        query.push(" ON CONFLICT (tx_hash, log_index, bet_epoch) DO NOTHING");

        query.build().execute(&mut **tx).await?;

        Ok(())
    }

    #[trace]
    async fn save_multi_claims(
        &self,
        multi_claims: &[MultiClaim],
        tx: &mut SqlxTransaction,
    ) -> Result<(), sqlx::Error> {
        if multi_claims.is_empty() {
            return Ok(());
        }

        let mut query = QueryBuilder::<Postgres>::new(format!(
            indoc! {"
                INSERT INTO {} (epoch, sender, claim_count, total_amount)
            "},
            Table::MultiClaim.as_str()
        ));

        query.push_values(multi_claims, |mut row, multi_claim| {
            row.push_bind(multi_claim.epoch as i64)
                .push_bind(multi_claim.sender.as_str().to_owned())
                .push_bind(multi_claim.claim_count as i32)
                .push_bind(multi_claim.total_amount.to_string())
                .push_unseparated("::numeric");
        });

        query.build().execute(&mut **tx).await?;

        Ok(())
    }

    #[trace]
    async fn mark_completed(
        &self,
        epoch: Epoch,
        tx: &mut SqlxTransaction,
    ) -> Result<(), sqlx::Error> {
        let query = format!(
            "INSERT INTO {} (epoch) VALUES ($1)",
            Table::FinEpoch.as_str()
        );

        sqlx::query(&query)
            .bind(epoch as i64)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    #[trace]
    async fn commit_epoch(&self, commit: &EpochCommit) -> Result<(), sqlx::Error> {
        let epoch = commit.round.epoch;
        let mut tx = self.create_tx().await?;

        self.delete_live_bets(epoch, &mut tx).await?;
        self.save_round(&commit.round, &mut tx).await?;
        self.save_bets(&commit.bets, &mut tx).await?;
        self.save_claims(&commit.claims, &mut tx).await?;
        self.save_multi_claims(&commit.multi_claims, &mut tx).await?;
        self.mark_completed(epoch, &mut tx).await?;

        tx.commit().await
    }

    #[trace]
    async fn record_epoch_error(&self, epoch: Epoch, message: &str) -> Result<(), sqlx::Error> {
        let query = format!(
            indoc! {"
                INSERT INTO {} (epoch, message, occurred_at)
                VALUES ($1, $2, now())
                ON CONFLICT (epoch)
                DO UPDATE SET message = EXCLUDED.message, occurred_at = EXCLUDED.occurred_at
            "},
            Table::ErrEpoch.as_str()
        );

        sqlx::query(&query)
            .bind(epoch as i64)
            .bind(message)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    #[trace]
    async fn get_round(&self, epoch: Epoch) -> Result<Option<Round>, sqlx::Error> {
        let query = format!(
            indoc! {"
                SELECT
                    epoch,
                    start_time,
                    lock_time,
                    close_time,
                    lock_price::text AS lock_price,
                    close_price::text AS close_price,
                    outcome,
                    total_amount::text AS total_amount,
                    up_amount::text AS up_amount,
                    down_amount::text AS down_amount,
                    up_odds::text AS up_odds,
                    down_odds::text AS down_odds
                FROM {}
                WHERE epoch = $1
            "},
            Table::Round.as_str()
        );

        sqlx::query(&query)
            .bind(epoch as i64)
            .fetch_optional(&*self.pool)
            .await?
            .map(round_from_row)
            .transpose()
    }

    #[trace]
    async fn count_bets(&self, epoch: Epoch) -> Result<u64, sqlx::Error> {
        let query = format!(
            "SELECT count(*) FROM {} WHERE epoch = $1",
            Table::HisBet.as_str()
        );

        let (count,) = sqlx::query_as::<_, (i64,)>(&query)
            .bind(epoch as i64)
            .fetch_one(&*self.pool)
            .await?;

        Ok(count as u64)
    }
}

fn round_from_row(row: PgRow) -> Result<Round, sqlx::Error> {
    let decode = |what: &str, error: String| {
        sqlx::Error::Decode(format!("cannot decode {what}: {error}").into())
    };

    let outcome = match row.try_get::<String, _>("outcome")?.as_str() {
        "UP" => RoundOutcome::Up,
        "DOWN" => RoundOutcome::Down,
        other => return Err(decode("outcome", other.to_string())),
    };

    let amount = |column: &str| -> Result<Amount, sqlx::Error> {
        let value = row.try_get::<String, _>(column)?;
        Amount::from_str(&value).map_err(|error| decode(column, error.to_string()))
    };

    let odds = |column: &str| -> Result<Odds, sqlx::Error> {
        let value = row.try_get::<String, _>(column)?;
        Odds::from_str(&value).map_err(|error| decode(column, error.to_string()))
    };

    let price = |column: &str| -> Result<Option<Price>, sqlx::Error> {
        row.try_get::<Option<String>, _>(column)?
            .map(|value| {
                Price::from_str(&value).map_err(|error| decode(column, error.to_string()))
            })
            .transpose()
    };

    Ok(Round {
        epoch: row.try_get::<i64, _>("epoch")? as u64,
        start_time: row.try_get("start_time")?,
        lock_time: row.try_get("lock_time")?,
        close_time: row.try_get("close_time")?,
        lock_price: price("lock_price")?,
        close_price: price("close_price")?,
        outcome,
        total_amount: amount("total_amount")?,
        up_amount: amount("up_amount")?,
        down_amount: amount("down_amount")?,
        up_odds: odds("up_odds")?,
        down_odds: odds("down_odds")?,
    })
}
