mod args;

use std::io;
use std::pin::pin;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use args::Args;
use clap::{CommandFactory as _, Parser as _, error::ErrorKind};
use mysa_cloud::{
    api::{ApiConfig, MysaApi as _, MysaClient},
    auth::{CognitoClient, CognitoConfig, TokenCache},
    connect::{device_filters, open_session},
    disguise::{REAL_MODEL, eligible_devices, firmware_warning, translate_commands, with_disguise},
    signal::shutdown_signal,
    sigv4::MqttEndpoint,
};
use tracing_subscriber::EnvFilter;

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

    let user = api.user().await.context("failed to get user")?;
    let devices = match eligible_devices(&user, args.device) {
        Ok(devices) => devices,
        Err(e) => Args::command()
            .error(ErrorKind::InvalidValue, format!("{e:#}"))
            .exit(),
    };
    if args.device.is_none() {
        println!(
            "Found {} with model {} in your account.",
            devices.len(),
            REAL_MODEL.as_str()
        );
    }

    if args.reset {
        for id in &devices {
            api.set_model(*id, REAL_MODEL, None).await?;
            println!("Restored Mysa thermostat {id} to model {}", REAL_MODEL.as_str());
        }
        return Ok(());
    }

    let firmware = api.firmware().await.context("failed to get firmware")?;
    for id in &devices {
        let version = firmware
            .get(id)
            .and_then(|f| f.installed_version.as_deref());
        if let Some(warning) = firmware_warning(*id, version) {
            eprintln!("{warning}");
        }
    }

    let credentials = cognito
        .get_credentials(&tokens)
        .await
        .context("failed to get AWS credentials")?;

    let mut session = open_session(
        &MqttEndpoint::mysa(),
        &credentials,
        &api_config.user_agent,
        device_filters(&devices, &["in", "out"]),
    )
    .await?;

    let shutdown = shutdown_signal()?;
    let interrupt = pin!(async {
        let signal = shutdown.await;
        println!("Got interrupt ({signal})...");
    });
    let result = with_disguise(&api, &devices, args.current, interrupt, |interrupt| {
        translate_commands(&mut session, &devices, interrupt)
    })
    .await;

    session.close().await;
    result
}
