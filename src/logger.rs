use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::config::{DEFAULT_LOG_FILTER, LOG_FILTER_ENV};
use crate::peer::types::IceCandidateInit;

static INIT: OnceCell<()> = OnceCell::new();

/// Install the fmt subscriber once; later calls are no-ops.
/// `PEERCALL_LOG` takes precedence over the build default.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = std::env::var(LOG_FILTER_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(filter))
            .with_target(true)
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            // host application already owns the global subscriber
            debug!("tracing subscriber already installed");
        }
    });
}

/// Trickle-ICE candidate as it appears
pub fn dump_candidate(label: &str, cand: &IceCandidateInit) {
    debug!(
        label,
        candidate = %cand.candidate,
        sdp_mid = ?cand.sdp_mid,
        sdp_mline_index = ?cand.sdp_mline_index,
        "trickle candidate"
    );
}

/// Counts per candidate type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates<'a>(
    candidates: impl IntoIterator<Item = &'a IceCandidateInit>,
) -> CandidateSummary {
    let mut summary = CandidateSummary::default();
    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "local candidate analysis"
    );
    if summary.relay == 0 {
        warn!("no TURN relay candidates gathered; connections through strict NAT may fail");
    }
    summary
}

/// Local candidates of one gathering run, summarized when it completes.
#[derive(Debug, Default)]
pub struct GatheringLog {
    gathered: Mutex<Vec<IceCandidateInit>>,
}

impl GatheringLog {
    pub fn record(&self, cand: &IceCandidateInit) {
        self.gathered.lock().push(cand.clone());
    }

    /// Logs the summary and starts over for the next run (ICE restart).
    pub fn complete(&self) -> CandidateSummary {
        let gathered = std::mem::take(&mut *self.gathered.lock());
        analyze_candidates(&gathered)
    }
}

/// Snapshot of getStats, nominated pair only
pub async fn dump_selected_pair(pc: &RTCPeerConnection, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}
