// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across sandkeep

// Persistence
pub const SANDKEEP_DATABASE_URL: &str = "SANDKEEP_DATABASE_URL";

// Sandbox image and resource limits
pub const SANDKEEP_BASE_IMAGE: &str = "SANDKEEP_BASE_IMAGE";
pub const SANDKEEP_MEMORY_LIMIT_MB: &str = "SANDKEEP_MEMORY_LIMIT_MB";
pub const SANDKEEP_CPU_PERIOD: &str = "SANDKEEP_CPU_PERIOD";
pub const SANDKEEP_CPU_QUOTA: &str = "SANDKEEP_CPU_QUOTA";
pub const SANDKEEP_PIDS_LIMIT: &str = "SANDKEEP_PIDS_LIMIT";

// Networking
pub const SANDKEEP_NETWORK_MODE: &str = "SANDKEEP_NETWORK_MODE";

// Shared directory bind mount
pub const SANDKEEP_SHARED_DIR_HOST_PATH: &str = "SANDKEEP_SHARED_DIR_HOST_PATH";
pub const SANDKEEP_SHARED_DIR_CONTAINER_PATH: &str = "SANDKEEP_SHARED_DIR_CONTAINER_PATH";

// Timeouts and intervals
pub const SANDKEEP_EXEC_TIMEOUT_SECS: &str = "SANDKEEP_EXEC_TIMEOUT_SECS";
pub const SANDKEEP_SWEEP_INTERVAL_SECS: &str = "SANDKEEP_SWEEP_INTERVAL_SECS";
pub const SANDKEEP_STOP_GRACE_SECS: &str = "SANDKEEP_STOP_GRACE_SECS";
pub const SANDKEEP_IMAGE_PULL_TIMEOUT_SECS: &str = "SANDKEEP_IMAGE_PULL_TIMEOUT_SECS";

// Reconciliation behaviour
pub const SANDKEEP_SERIALIZE_CALLERS: &str = "SANDKEEP_SERIALIZE_CALLERS";
pub const SANDKEEP_CONTAINER_LABEL: &str = "SANDKEEP_CONTAINER_LABEL";

// Logging
pub const RUST_LOG: &str = "RUST_LOG";
