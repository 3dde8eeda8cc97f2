use std::path::PathBuf;

use clap::Parser;
use mysa_cloud::mysa::DeviceId;

/// Prints the status of your Mysa thermostats, then logs their realtime
/// MQTT messages.
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

    /// Specific device (MAC address); may be repeated
    #[arg(short, long)]
    pub device: Vec<DeviceId>,

    /// Exit after printing status information, don't watch for realtime MQTT messages
    #[arg(short = 'W', long)]
    pub no_watch: bool,

    /// Dump the JSON of every REST endpoint used
    #[arg(long)]
    pub dump_lots: bool,

    /// Dump the ID token and a cURL command
    #[arg(long)]
    pub dump_token: bool,
}
