use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;

use wdt::{LogProgressReporter, ProgressReporter, Receiver, TransferRequest, Wdt, WdtOptions};

fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "wdt=info".into()),
        )
        .init();

    // Config
    let options = WdtOptions::from_env().context("invalid WDT_* setting")?;
    let mode = std::env::var("WDT_MODE").unwrap_or_else(|_| "receive".into());
    let directory: PathBuf = std::env::var("WDT_DIRECTORY")
        .context("WDT_DIRECTORY must be set")?
        .into();
    let identity = std::env::var("WDT_IDENTITY").unwrap_or_default();

    let code = match mode.as_str() {
        "receive" => receive(options, directory, identity)?,
        "send" => send(options, directory, identity)?,
        other => bail!("WDT_MODE must be receive or send, got {:?}", other),
    };

    info!("transfer finished: {}", code);
    if !code.is_ok() {
        std::process::exit(1);
    }
    Ok(())
}

fn receive(options: WdtOptions, directory: PathBuf, identity: String) -> anyhow::Result<wdt::ErrorCode> {
    let request = TransferRequest::new(options.start_port, options.num_ports, directory)
        .with_identity(identity);
    let mut receiver = Receiver::from_request(request, Arc::new(options));
    let request = receiver.init()?;

    let ports: Vec<String> = request.ports.iter().map(|p| p.to_string()).collect();
    println!("WDT_PORTS={}", ports.join(","));
    info!(dir = %request.directory.display(), "receiving");

    let code = receiver.transfer_async();
    if !code.is_ok() {
        return Ok(code);
    }
    let report = receiver.finish();
    info!("{}", report);
    Ok(report.error_code())
}

fn send(options: WdtOptions, directory: PathBuf, identity: String) -> anyhow::Result<wdt::ErrorCode> {
    let host = std::env::var("WDT_HOST").unwrap_or_else(|_| "localhost".into());
    let ports = match std::env::var("WDT_PORTS") {
        Ok(list) => parse_ports(&list)?,
        Err(_) => Vec::new(),
    };

    let request = TransferRequest::new(options.start_port, options.num_ports, directory)
        .with_host(host)
        .with_ports(ports);
    info!(host = %request.host, ports = ?request.dial_ports(), "sending");

    let wdt = Wdt::new("wdt-cli", options);
    let reporter: Arc<dyn ProgressReporter> = Arc::new(LogProgressReporter);
    Ok(wdt.wdt_send(&identity, request, Some(reporter), true))
}

fn parse_ports(list: &str) -> anyhow::Result<Vec<u16>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u16>().with_context(|| format!("bad port {:?} in WDT_PORTS", s)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_lists() {
        assert_eq!(parse_ports("1, 2,3,").unwrap(), vec![1, 2, 3]);
        assert!(parse_ports("").unwrap().is_empty());
        assert!(parse_ports("1,x").is_err());
    }
}
