//! Phase tracker for the in-flight reconfiguration of one partition

use ra_core::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Kind of reconfiguration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconfigurationType {
    /// No primary change
    #[default]
    Other,
    /// The primary failed; a new one is elected from the configuration
    Failover,
    /// The primary hands over to a designated secondary
    SwapPrimary,
}

/// Phase of a reconfiguration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconfigurationStage {
    /// Not reconfiguring
    #[default]
    None,
    /// Outgoing primary catches up its secondaries and demotes
    Phase0Demote,
    /// New primary collects replica progress
    Phase1GetLsn,
    /// New primary catches up the configuration
    Phase2Catchup,
    /// Previous configuration is deactivated
    Phase3Deactivate,
    /// Current configuration is activated
    Phase4Activate,
    /// A demote is being cancelled
    AbortPhase0Demote,
}

impl fmt::Display for ReconfigurationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconfigurationStage::None => "None",
            ReconfigurationStage::Phase0Demote => "Phase0_Demote",
            ReconfigurationStage::Phase1GetLsn => "Phase1_GetLSN",
            ReconfigurationStage::Phase2Catchup => "Phase2_Catchup",
            ReconfigurationStage::Phase3Deactivate => "Phase3_Deactivate",
            ReconfigurationStage::Phase4Activate => "Phase4_Activate",
            ReconfigurationStage::AbortPhase0Demote => "Abort_Phase0_Demote",
        };
        f.write_str(name)
    }
}

/// How the last reconfiguration ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReconfigurationResult {
    /// Nothing finished yet
    #[default]
    None,
    /// All phases done; `DoReconfigurationReply` sent
    Completed,
    /// Another replica should be primary; `ChangeConfiguration` sent
    ChangeConfiguration,
    /// Outgoing primary demoted; swap handed to the new primary
    DemoteCompleted,
    /// Swap cancelled by a newer reconfiguration
    AbortSwapPrimary,
}

/// Reconfiguration state of one failover unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigurationState {
    kind: ReconfigurationType,
    stage: ReconfigurationStage,
    start_time: Timestamp,
    phase_start_time: Timestamp,
    phase0_duration_ms: Option<u64>,
    result: ReconfigurationResult,
    data_loss_reported: Option<i64>,
}

impl ReconfigurationState {
    /// Kind of the current or last reconfiguration
    pub fn kind(&self) -> ReconfigurationType {
        self.kind
    }

    /// Current stage
    pub fn stage(&self) -> ReconfigurationStage {
        self.stage
    }

    /// Result of the last finished reconfiguration
    pub fn result(&self) -> ReconfigurationResult {
        self.result
    }

    /// Whether a reconfiguration is running
    pub fn is_reconfiguring(&self) -> bool {
        self.stage != ReconfigurationStage::None
    }

    /// Whether the reconfiguration is a swap
    pub fn is_swap_primary(&self) -> bool {
        self.kind == ReconfigurationType::SwapPrimary
    }

    /// Whether the running reconfiguration is a failover
    pub fn is_failover(&self) -> bool {
        self.kind == ReconfigurationType::Failover
    }

    /// Duration of the demote phase handed over by the old primary
    pub fn phase0_duration(&self) -> Option<Duration> {
        self.phase0_duration_ms.map(Duration::from_millis)
    }

    /// Time the reconfiguration started
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// Time spent in the current phase
    pub fn phase_elapsed(&self, now: Timestamp) -> Duration {
        now.saturating_since(self.phase_start_time)
    }

    /// Data loss number already reported to the FM
    pub fn data_loss_reported(&self) -> Option<i64> {
        self.data_loss_reported
    }

    /// Record a data loss report
    pub fn set_data_loss_reported(&mut self, data_loss_number: i64) {
        self.data_loss_reported = Some(data_loss_number);
    }

    /// Begin a reconfiguration and return its first stage
    ///
    /// A swap starts with a demote only on the outgoing primary; the incoming primary goes
    /// straight to catch-up.
    ///
    /// # Panics
    ///
    /// If a reconfiguration is already running.
    pub fn start(
        &mut self,
        kind: ReconfigurationType,
        is_local_outgoing_primary: bool,
        phase0_duration_ms: Option<u64>,
        now: Timestamp,
    ) -> ReconfigurationStage {
        assert!(
            !self.is_reconfiguring(),
            "reconfiguration started while in {}",
            self.stage
        );
        let stage = match kind {
            ReconfigurationType::Failover => ReconfigurationStage::Phase1GetLsn,
            ReconfigurationType::SwapPrimary if is_local_outgoing_primary => {
                ReconfigurationStage::Phase0Demote
            }
            ReconfigurationType::SwapPrimary | ReconfigurationType::Other => {
                ReconfigurationStage::Phase2Catchup
            }
        };
        self.kind = kind;
        self.stage = stage;
        self.start_time = now;
        self.phase_start_time = now;
        self.phase0_duration_ms = phase0_duration_ms;
        self.result = ReconfigurationResult::None;
        self.data_loss_reported = None;
        stage
    }

    /// Move to `stage`
    pub fn start_phase(&mut self, stage: ReconfigurationStage, now: Timestamp) {
        self.stage = stage;
        self.phase_start_time = now;
    }

    /// End the reconfiguration with `result`
    pub fn finish(&mut self, result: ReconfigurationResult) {
        self.stage = ReconfigurationStage::None;
        self.result = result;
    }

    /// Turn the running swap into an ordinary reconfiguration
    pub fn convert_to_other(&mut self) {
        self.kind = ReconfigurationType::Other;
    }
}

impl fmt::Display for ReconfigurationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}", self.kind, self.stage)
    }
}
