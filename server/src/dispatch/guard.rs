//! Claimed-campaign guard.
//!
//! A worker that claims a campaign (`sending` -> `processing`) holds one of
//! these for the whole batch. Unless the worker defuses it after completion
//! bookkeeping, the guard hands the campaign back to `sending` on every exit
//! path, panics included, so a crash never strands a campaign in
//! `processing`.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use crate::{
    model::{CampaignId, CampaignStatus},
    store::CampaignStore,
};

use super::EngineState;

pub type ActiveSet = Arc<Mutex<HashSet<CampaignId>>>;

pub struct CampaignGuard {
    state: EngineState,
    campaign_id: CampaignId,
    active: ActiveSet,
    defused: bool,
}

impl CampaignGuard {
    pub fn new(state: EngineState, campaign_id: CampaignId, active: ActiveSet) -> Self {
        active.lock().unwrap().insert(campaign_id);
        Self {
            state,
            campaign_id,
            active,
            defused: false,
        }
    }

    /// Completion logic wrote the campaign's final status; the guard has
    /// nothing left to restore.
    pub fn defuse(mut self) {
        self.defused = true;
    }
}

impl Drop for CampaignGuard {
    fn drop(&mut self) {
        self.active.lock().unwrap().remove(&self.campaign_id);
        if self.defused {
            return;
        }
        let state = self.state.clone();
        let id = self.campaign_id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                restore_processing(&state, id).await;
            });
        } else {
            tracing::error!("No runtime to restore campaign {id} from processing");
        }
    }
}

/// Idempotent recovery write: only a campaign still in `processing` is
/// touched.
pub async fn restore_processing(state: &EngineState, id: CampaignId) {
    match state.store.campaign_status(id).await {
        Ok(Some(CampaignStatus::Processing)) => {
            match state.store.set_status(id, CampaignStatus::Sending).await {
                Ok(()) => {
                    tracing::warn!("Campaign {id} restored to sending after abnormal batch exit")
                }
                Err(e) => tracing::error!("Failed to restore campaign {id}: {e}"),
            }
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Failed to read campaign {id} status during recovery: {e}"),
    }
}
