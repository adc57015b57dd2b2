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

use crate::domain::Epoch;
use std::time::Duration;

/// Per-epoch distributed mutex with TTL.
///
/// Implementations fail closed: when the lock service is unreachable, `acquire` returns `false`
/// rather than proceeding without mutual exclusion. The lock does not verify holder identity;
/// the completion marker is the authoritative idempotence check.
#[trait_variant::make(Send)]
pub trait EpochLock
where
    Self: Clone + Send + Sync + 'static,
{
    /// Atomically take ownership of the epoch unless another worker holds it. Returns `true`
    /// iff the caller now owns the lock.
    async fn acquire(&self, epoch: Epoch, ttl: Duration) -> bool;

    /// Reset the expiry of a held lock; used by holders whose work outlives half the TTL.
    async fn extend(&self, epoch: Epoch, ttl: Duration) -> bool;

    /// Unconditionally give up ownership of the epoch.
    async fn release(&self, epoch: Epoch);
}
