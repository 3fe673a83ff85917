//! Configuration constants for the shot driver
//!
//! This module centralizes the tunable parameters, directory names and file
//! naming conventions shared by the coordinator, the shot runner and the
//! engine bridge.

use std::time::Duration;

// ============================================================================
// Serialization
// ============================================================================

/// Keys starting with this prefix are private state and never checkpointed
pub const RESERVED_PREFIX: &str = "_";

// ============================================================================
// Engine Configuration
// ============================================================================

/// Element of the engine XML holding the acoustic solver settings
pub const ACOUSTIC_SOLVER_ELEMENT: &str = "AcousticSEM";

/// Bridge executable, relative to the `--geosx` installation directory
pub const ENGINE_BRIDGE_PATH: &str = "bin/pygeosx_bridge";

/// Time an engine bridge gets to exit once its input is closed
pub const ENGINE_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Ricker wavelet peak frequency (Hz) used as the forward source
pub const DEFAULT_SOURCE_FREQUENCY: f64 = 5.0;

// ============================================================================
// Output Layout
// ============================================================================

/// Directory (inside the batch output dir) receiving wavefield snapshots and
/// per-shot partial gradients
pub const GRADIENT_DIR: &str = "partialGradient";

/// Directory (inside the batch output dir) receiving per-shot partial costs
pub const COST_DIR: &str = "partialCostFunction";

/// File holding the summed cost of a batch, inside the batch output dir
pub const FULL_COST_FILE: &str = "fullCostFunction";

/// Directory receiving the rendered per-shot XML decks
pub const SHOT_XML_DIR: &str = "xml";

/// Directory receiving the rank markers of the file barrier
pub const BARRIER_DIR: &str = "barrier";

// ============================================================================
// Dispatch Configuration
// ============================================================================

/// Upper bound on the batches of one dispatch; batch ids are four-digit file stems
pub const MAX_BATCH_COUNT: usize = 9999;

/// Interval between two checks of a file barrier
pub const BARRIER_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Interval between two scheduler queue queries
pub const SCHEDULER_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive failed queue queries before a job is given up on
pub const SCHEDULER_MAX_QUERY_FAILURES: usize = 5;

/// Rank and size variables set by the supported MPI launchers, checked in order
pub const PROCESS_GROUP_ENV_VARS: &[(&str, &str)] = &[
    ("OMPI_COMM_WORLD_RANK", "OMPI_COMM_WORLD_SIZE"),
    ("PMI_RANK", "PMI_SIZE"),
    ("SLURM_PROCID", "SLURM_STEP_NUM_TASKS"),
];

/// Set only inside a SLURM job step; an allocation shell carries the job's
/// task count instead
pub const SLURM_STEP_ENV_VAR: &str = "SLURM_STEP_ID";
