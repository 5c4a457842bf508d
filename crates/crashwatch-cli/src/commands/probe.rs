//! One-statement round trip against a server.

use std::net::{SocketAddr, ToSocketAddrs};
use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use crashwatch::Supervisor;
use crashwatch::settings::{client_config, launch_spec, server_addr, supervisor_config};
use crashwatch_wire::{ResponseStatus, WireClient};

use super::{GlobalOptions, load_config};
use crate::style::{print_error, print_labeled, print_success, print_warn};

pub fn run(
    options: &GlobalOptions,
    address: Option<&str>,
    statement: &str,
    launch: bool,
) -> Result<ExitCode> {
    let config = load_config(options)?;
    let addr = match address {
        Some(address) => resolve(address)?,
        None => server_addr(&config).context("failed to resolve the configured server address")?,
    };

    let mut launched = None;
    let mut supervisor = Supervisor::new(supervisor_config(&config));
    if launch {
        let instance = format!("{}_probe", config.server.instance_prefix);
        let log_dir = config.scenarios.artifacts_dir.join("probe");
        let spec = launch_spec(&config, &instance, addr, log_dir);
        let handle = supervisor
            .start(&spec)
            .with_context(|| format!("failed to start {}", spec.binary.display()))?;
        print_success(&format!("server started (pid {})", handle.pid()));
        launched = Some(handle);
    }

    let client = client_config(&config.wire);
    let result = WireClient::send_once(addr, &client, statement, config.wire.statement_timeout());

    if let Some(mut handle) = launched {
        supervisor
            .stop(&mut handle, config.server.graceful_timeout())
            .context("failed to stop the launched server")?;
    }

    match result {
        Ok(response) => {
            print_labeled("address", &addr.to_string());
            print_labeled("latency", &format!("{:.1} ms", response.elapsed.as_secs_f64() * 1000.0));
            print_labeled("response", response.text.trim());
            match response.status {
                ResponseStatus::Ok => {
                    print_success("ok");
                    Ok(ExitCode::SUCCESS)
                }
                ResponseStatus::SqlError => {
                    print_warn("sql error");
                    Ok(ExitCode::FAILURE)
                }
                ResponseStatus::Aborted => {
                    print_warn("aborted");
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Err(e) => {
            print_error(&format!("{addr}: {e}"));
            Ok(ExitCode::FAILURE)
        }
    }
}

fn resolve(address: &str) -> Result<SocketAddr> {
    let Some(addr) = address
        .to_socket_addrs()
        .with_context(|| format!("invalid address `{address}`"))?
        .next()
    else {
        bail!("`{address}` did not resolve");
    };
    Ok(addr)
}
