//! Host volume feasibility and claim selection.
//!
//! For every volume a task group asks for, a node must host a ready volume
//! of that name in the job's namespace that
//!
//! 1. declares at least one of the requested capabilities,
//! 2. is at least as large as the requested minimum, and
//! 3. can take one more claim next to the claims already held on it.
//!
//! The first failing check across all candidate volumes is the reason the
//! node is filtered, so diagnostics name the most specific problem.

use std::collections::BTreeMap;

use corral_state::{
    HostVolume, HostVolumeState, Node, StateSnapshot, VolumeClaim, VolumeRequest,
    claims_conflict,
};

use crate::feasible::{
    FILTER_VOLUME_CAPABILITY, FILTER_VOLUME_CAPACITY, FILTER_VOLUME_CLAIMED,
    FILTER_VOLUME_MISSING,
};

/// Pick one volume per request on `node`. `held` returns the claims
/// already granted on a volume, including ones from the plan in progress.
pub fn select_claims(
    snapshot: &StateSnapshot,
    node: &Node,
    namespace: &str,
    requests: &BTreeMap<String, VolumeRequest>,
    held: impl Fn(&str) -> Vec<VolumeClaim>,
) -> Result<Vec<VolumeClaim>, &'static str> {
    let hosted = snapshot.host_volumes_by_node(&node.id);
    let mut chosen: Vec<VolumeClaim> = Vec::new();

    for request in requests.values() {
        let candidates: Vec<&HostVolume> = hosted
            .iter()
            .copied()
            .filter(|v| {
                v.namespace == namespace
                    && v.name == request.source
                    && v.state == HostVolumeState::Ready
            })
            .collect();
        if candidates.is_empty() {
            return Err(FILTER_VOLUME_MISSING);
        }

        let capable: Vec<_> = candidates
            .into_iter()
            .filter_map(|v| v.match_capability(&request.capabilities).map(|cap| (v, cap)))
            .collect();
        if capable.is_empty() {
            return Err(FILTER_VOLUME_CAPABILITY);
        }

        let sized: Vec<_> = capable
            .into_iter()
            .filter(|(v, _)| v.capacity_bytes >= request.min_capacity_bytes)
            .collect();
        if sized.is_empty() {
            return Err(FILTER_VOLUME_CAPACITY);
        }

        let claim = sized.into_iter().find_map(|(vol, cap)| {
            let claim = VolumeClaim {
                volume_id: vol.id.clone(),
                volume_name: vol.name.clone(),
                attachment_mode: cap.attachment_mode,
                access_mode: cap.access_mode,
                read_only: request.read_only || cap.access_mode.is_reader_only(),
            };
            let mut existing = held(&vol.id);
            existing.extend(chosen.iter().filter(|c| c.volume_id == vol.id).cloned());
            let free = existing.iter().all(|e| !claims_conflict(e, &claim));
            free.then_some(claim)
        });
        match claim {
            Some(claim) => chosen.push(claim),
            None => return Err(FILTER_VOLUME_CLAIMED),
        }
    }

    Ok(chosen)
}
