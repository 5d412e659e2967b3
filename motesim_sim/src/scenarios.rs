//! Named headless scenarios.

use serde::Serialize;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioId {
    /// Many motes boot with startup jitter and all of them log
    BootStorm,

    /// Heavy log traffic through a tiny history buffer
    LogFlood,

    /// Motes are removed and added while the simulation runs
    MoteChurn,

    /// Simulated time is capped relative to wall-clock time
    SpeedLimited,

    /// One mote's CPU crashes mid-run
    FaultInjection,

    /// One mote hits a breakpoint
    Breakpoint,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::BootStorm,
            ScenarioId::LogFlood,
            ScenarioId::MoteChurn,
            ScenarioId::SpeedLimited,
            ScenarioId::FaultInjection,
            ScenarioId::Breakpoint,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::BootStorm => "boot_storm",
            ScenarioId::LogFlood => "log_flood",
            ScenarioId::MoteChurn => "mote_churn",
            ScenarioId::SpeedLimited => "speed_limited",
            ScenarioId::FaultInjection => "fault_injection",
            ScenarioId::Breakpoint => "breakpoint",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::BootStorm => "All motes boot within the startup window and produce log output",
            ScenarioId::LogFlood => "Every burst logs; the history keeps only the newest lines",
            ScenarioId::MoteChurn => "The oldest mote is replaced every tenth of the run",
            ScenarioId::SpeedLimited => "Simulated time never outruns wall-clock time times the limit",
            ScenarioId::FaultInjection => "A crashing CPU stops the run and names its mote",
            ScenarioId::Breakpoint => "A breakpoint stops the run without a fault",
        }
    }

    /// True if the run is expected to end before its duration.
    pub fn stops_early(&self) -> bool {
        matches!(self, ScenarioId::FaultInjection | ScenarioId::Breakpoint)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "boot_storm" | "bootstorm" => Ok(ScenarioId::BootStorm),
            "log_flood" | "logflood" => Ok(ScenarioId::LogFlood),
            "mote_churn" | "motechurn" | "churn" => Ok(ScenarioId::MoteChurn),
            "speed_limited" | "speedlimited" => Ok(ScenarioId::SpeedLimited),
            "fault_injection" | "faultinjection" | "fault" => Ok(ScenarioId::FaultInjection),
            "breakpoint" => Ok(ScenarioId::Breakpoint),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
