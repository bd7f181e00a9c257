//! Race command implementation.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use fido_assert_core::{AssertionRace, AssertionResponse, RaceConfig};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::device_spec::parse_devices;
use crate::utils::{b64url, build_request};
use crate::RequestArgs;

/// Arguments of the race command.
pub struct RaceArgs {
    pub request: RequestArgs,
    pub devices: Vec<String>,
    pub deadline_secs: Option<u64>,
    pub retries: Option<u32>,
    pub cancel_after_ms: Option<u64>,
    pub json: bool,
    pub quiet: bool,
}

#[derive(Serialize)]
struct UserOutput {
    id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

/// JSON shape of a won assertion; binary fields are base64url.
#[derive(Serialize)]
struct AssertionOutput {
    request_id: String,
    credential_id: String,
    authenticator_data: String,
    signature: String,
    sign_count: u32,
    user_present: bool,
    user_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<UserOutput>,
}

impl AssertionOutput {
    fn new(request_id: String, response: &AssertionResponse) -> Self {
        Self {
            request_id,
            credential_id: b64url(&response.credential_id),
            authenticator_data: b64url(&response.auth_data.to_bytes()),
            signature: b64url(&response.signature),
            sign_count: response.auth_data.counter,
            user_present: response.auth_data.user_present(),
            user_verified: response.auth_data.user_verified(),
            user: response.user.as_ref().map(|u| UserOutput {
                id: b64url(&u.id),
                name: u.name.clone(),
            }),
        }
    }
}

/// Execute the race command.
pub async fn execute(args: RaceArgs) -> Result<()> {
    let request = build_request(&args.request)?;
    if args.devices.is_empty() && args.cancel_after_ms.is_none() && args.deadline_secs.is_none()
    {
        bail!("Invalid request: no --device given and nothing would end the race");
    }
    let devices = parse_devices(&args.devices)?;

    let mut config = RaceConfig::from_env();
    if let Some(secs) = args.deadline_secs {
        config.deadline = Some(Duration::from_secs(secs));
    }
    if let Some(retries) = args.retries {
        config.transport_retries = retries;
    }
    debug!(?config, devices = devices.len(), "Starting race");

    let pending = AssertionRace::new(config).submit(request, devices);
    let request_id = pending.request_id().to_string();

    let controller = pending.controller();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling race");
            controller.cancel_all();
        }
    });

    if let Some(ms) = args.cancel_after_ms {
        let controller = pending.controller();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            info!(after_ms = ms, "Cancelling race");
            controller.cancel_all();
        });
    }

    let response = pending.wait().await.context("Assertion failed")?;

    info!(
        request_id = %request_id,
        credential = %hex::encode(&response.credential_id),
        "Assertion obtained"
    );

    if args.json {
        let output = AssertionOutput::new(request_id, &response);
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else if !args.quiet {
        print_assertion(&request_id, &response);
    }
    Ok(())
}

fn print_assertion(request_id: &str, response: &AssertionResponse) {
    println!();
    println!("{}", "╔════════════════════════════════════════╗".green());
    println!(
        "{}",
        "║          ASSERTION OBTAINED            ║".green().bold()
    );
    println!("{}", "╚════════════════════════════════════════╝".green());
    println!();
    println!("   {} {}", "Request:".dimmed(), request_id);
    println!(
        "   {} {}",
        "Credential:".dimmed(),
        hex::encode(&response.credential_id)
    );
    println!(
        "   {} {}",
        "Sign count:".dimmed(),
        response.auth_data.counter
    );
    println!(
        "   {} {}",
        "Signature:".dimmed(),
        hex::encode(&response.signature)
    );
    let presence = if response.auth_data.user_verified() {
        "present, verified".green()
    } else if response.auth_data.user_present() {
        "present".green()
    } else {
        "not present".yellow()
    };
    println!("   {} {}", "User:".dimmed(), presence);
    if let Some(user) = &response.user {
        println!(
            "   {} {} {}",
            "Account:".dimmed(),
            hex::encode(&user.id),
            user.name.as_deref().unwrap_or_default()
        );
    }
}
