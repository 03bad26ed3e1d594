//! Common CLI options shared across commands

use std::fmt;

use clap::Parser;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MEMORY_USER_STR: &str = "512M";

/// Memory size options
#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
pub struct MemoryOpts {
    #[clap(
        long,
        default_value = DEFAULT_MEMORY_USER_STR,
        help = "Guest memory size (e.g. 1G, 512M, or plain number for MB)"
    )]
    pub memory: String,
}

impl fmt::Display for MemoryOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.memory)
    }
}

/// Guest control channel credentials
#[derive(Parser, Debug, Clone)]
pub struct GuestOpts {
    #[clap(
        long,
        default_value = "root",
        help = "Guest account the control channel authenticates as"
    )]
    pub guest_user: String,

    #[clap(
        long,
        env = "VMLAB_GUEST_PASSWORD",
        hide_env_values = true,
        help = "Guest password for the control channel"
    )]
    pub guest_password: String,
}

/// Readiness and command timeout knobs
#[derive(Parser, Debug, Clone)]
pub struct TimeoutOpts {
    #[clap(
        long,
        default_value_t = 120,
        help = "Seconds to wait for a guest to accept authenticated connections"
    )]
    pub ssh_timeout: u64,

    #[clap(
        long,
        default_value_t = 60,
        help = "Seconds before a guest command is killed and reported as timed out"
    )]
    pub command_timeout: u64,
}
