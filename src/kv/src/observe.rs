// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Legacy observe-based durability.
//!
//! When a caller asks for persist-to/replicate-to thresholds instead of
//! native durability, the mutation is issued without a durability level and
//! this loop then polls observe-seqno on the active and replica copies
//! until the mutation's sequence number is persisted and replicated widely
//! enough, or the deadline passes.

use std::sync::Arc;
use std::time::Duration;

use cbx_error::{Error, KeyValueError};
use futures::future::join_all;
use tokio::time::Instant;
use tracing::debug;

use crate::cluster::ClusterCore;
use crate::document_id::DocumentId;
use crate::operations::{ObserveSeqnoRequest, RequestOptions};
use crate::protocol::MutationToken;

/// Observe-based durability thresholds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObserveRequirements {
    /// Number of nodes (the active counts) that must have persisted the
    /// mutation.
    pub persist_to: u32,
    /// Number of replicas that must hold the mutation in memory.
    pub replicate_to: u32,
}

impl ObserveRequirements {
    pub fn is_empty(&self) -> bool {
        self.persist_to == 0 && self.replicate_to == 0
    }
}

const POLL_FLOOR: Duration = Duration::from_millis(10);
const POLL_CEILING: Duration = Duration::from_millis(100);

/// Polls observe-seqno until `requirements` hold for the mutation `token`.
/// Resolves `None` on success and the durability error otherwise; the
/// caller keeps the mutation's CAS either way.
pub(crate) async fn enforce_requirements(
    core: Arc<ClusterCore>,
    id: DocumentId,
    token: MutationToken,
    requirements: ObserveRequirements,
    timeout: Duration,
) -> Option<Error> {
    let deadline = Instant::now() + timeout;
    let mut interval = POLL_FLOOR;

    loop {
        let config = match core.config.bucket_configuration(id.bucket()).await {
            Ok(config) => config,
            Err(_) => return Some(KeyValueError::DurabilityAmbiguous.into()),
        };
        let num_replicas = config.num_replicas.unwrap_or(0);
        if requirements.persist_to > num_replicas + 1 || requirements.replicate_to > num_replicas {
            return Some(KeyValueError::DurabilityImpossible.into());
        }

        let polls = (0..=num_replicas).map(|rank| {
            core.dispatcher.execute_async(ObserveSeqnoRequest {
                id: id.clone(),
                partition: token.partition_id,
                partition_uuid: token.partition_uuid,
                rank,
                options: RequestOptions::default(),
            })
        });

        let mut persisted = 0u32;
        let mut replicated = 0u32;
        for (rank, response) in join_all(polls).await.into_iter().enumerate() {
            let Some(state) = response.result else {
                // A copy that cannot answer simply does not count this
                // round.
                continue;
            };
            if state.partition_uuid != token.partition_uuid {
                // The partition failed over; whether the mutation survived
                // is unknowable from here.
                debug!(
                    "partition {} changed uuid during observe poll",
                    token.partition_id
                );
                return Some(KeyValueError::DurabilityAmbiguous.into());
            }
            if state.last_persisted_seqno >= token.sequence_number {
                persisted += 1;
            }
            if rank > 0 && state.current_seqno >= token.sequence_number {
                replicated += 1;
            }
        }

        if persisted >= requirements.persist_to && replicated >= requirements.replicate_to {
            return None;
        }

        let now = Instant::now();
        if now + interval >= deadline {
            return Some(KeyValueError::DurabilityAmbiguous.into());
        }
        tokio::time::sleep(interval).await;
        interval = (interval * 2).min(POLL_CEILING);
    }
}
