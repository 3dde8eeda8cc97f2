use std::path::PathBuf;

use clap::Parser;
use mysa_cloud::mysa::DeviceId;

/// Makes your Mysa Lite thermostat (model BB-V2-0-L) look like a Mysa
/// Baseboard V1 thermostat (model BB-V1-1) to the official Mysa apps.
///
/// This enables zone control, the usage graph, and the humidity sensor in
/// the app. The disguise lasts while this runs.
#[derive(Debug, Parser)]
pub struct Args {
    /// Mysa username
    #[arg(short, long, env = "MYSA_USERNAME")]
    pub user: Option<String>,

    /// Mysa password
    #[arg(short, long, env = "MYSA_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Log in with a refresh token instead of the password
    #[arg(long, env = "MYSA_REFRESH_TOKEN", hide_env_values = true)]
    pub refresh_token: Option<String>,

    /// File remembering logins between runs [default: mysa-cloud/credentials.toml in the config directory]
    #[arg(long, env = "MYSA_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Neither reuse nor save logins
    #[arg(long)]
    pub no_cache: bool,

    /// Specific device (MAC address)
    #[arg(short, long)]
    pub device: Option<DeviceId>,

    /// Estimated max current level (in Amperes); Mysa Lite devices don't have current sensors
    #[arg(short = 'C', long)]
    pub current: Option<f64>,

    /// Just restore disguised Mysa Lite devices, and exit
    #[arg(short = 'R', long)]
    pub reset: bool,
}
