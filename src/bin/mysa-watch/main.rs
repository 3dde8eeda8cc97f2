mod args;

use std::io;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use args::Args;
use clap::Parser as _;
use mysa_cloud::{
    api::{ApiConfig, MysaClient},
    auth::{CognitoClient, CognitoConfig, TokenCache, Tokens},
    connect::{device_filters, open_session},
    mysa::DeviceId,
    registry::Registry,
    render::status_report,
    signal::shutdown_signal,
    sigv4::MqttEndpoint,
    watch::watch,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DUMPED_ENDPOINTS: [&str; 4] = ["/users", "/devices", "/devices/state", "/devices/firmware"];

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = run().await {
        eprintln!("{e:#}");
        return ExitCode::from(1);
    }

    ExitCode::from(0)
}

async fn run() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOGLEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cognito = CognitoClient::new(CognitoConfig::mysa())?;
    let (user, password, refresh_token) = (
        args.user.as_deref(),
        args.password.as_deref(),
        args.refresh_token.as_deref(),
    );
    let signed_in = if args.no_cache {
        cognito.sign_in(user, password, refresh_token).await
    } else {
        let cache = match &args.credentials {
            Some(path) => TokenCache::new(path.clone()),
            None => TokenCache::default_location()?,
        };
        cognito
            .sign_in_cached(&cache, user, password, refresh_token)
            .await
    };
    let tokens = signed_in.context("failed to log in")?;

    let api_config = ApiConfig::mysa();
    let api = MysaClient::new(&api_config, &tokens.id_token)?;

    if args.dump_token {
        dump_token(&tokens, &api_config)?;
    }

    if args.dump_lots {
        for path in DUMPED_ENDPOINTS {
            let body = api.get_json(path).await?;
            println!("GET {path}");
            println!("{}", "=".repeat(path.len() + 4));
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    let mut registry = Registry::load(&api, &args.device).await?;

    for (id, device) in &registry.devices {
        print!(
            "{}",
            status_report(device, registry.firmware_version(id), registry.states.get(id))
        );
    }

    if args.no_watch {
        return Ok(());
    }

    let credentials = cognito
        .get_credentials(&tokens)
        .await
        .context("failed to get AWS credentials")?;

    let ids: Vec<DeviceId> = registry.devices.keys().copied().collect();
    let mut session = open_session(
        &MqttEndpoint::mysa(),
        &credentials,
        &api_config.user_agent,
        device_filters(&ids, &["in", "out", "batch"]),
    )
    .await?;

    let shutdown = shutdown_signal()?;
    watch(&mut session, &mut registry, &api, &mut io::stdout(), async {
        let signal = shutdown.await;
        info!(signal, "stopping");
    })
    .await
}

fn dump_token(tokens: &Tokens, api_config: &ApiConfig) -> Result<()> {
    println!("Cognito ID token:");
    println!("=================");
    println!("{}", tokens.id_token);
    println!("Cognito ID claims:");
    println!("==================");
    println!("{}", serde_json::to_string_pretty(&tokens.claims()?)?);
    println!("cURL template:");
    println!("==============");
    println!(
        "curl -H 'authorization: {}' -H 'user-agent: {}' '{}'",
        tokens.id_token, api_config.user_agent, api_config.base_url
    );
    Ok(())
}
