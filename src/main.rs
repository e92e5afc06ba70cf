use std::process::ExitCode;

use tokio::net::TcpListener;
use tracing::info;

use cql_proxy::backend::BackendOpts;
use cql_proxy::opts::{self, Opts, USAGE};
use cql_proxy::proxy::server;
use cql_proxy::{Error, Result};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let _ = color_eyre::install();

    let opts = match Opts::parse(std::env::args().skip(1)) {
        Ok(opts) => opts,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(opts: Opts) -> Result<()> {
    let bundle = opts::load_bundle(&opts.bundle)?;
    let backend = BackendOpts {
        host: bundle.host,
        port: bundle.port,
        username: opts.username,
        password: opts.password,
    };

    let proxy = server::bootstrap(backend).await?;

    let listener = TcpListener::bind((opts.bind.as_str(), opts.port))
        .await
        .map_err(|err| Error::BadConfig(format!("Unable to bind {}:{}: {err}", opts.bind, opts.port)))?;
    info!(
        bind = %opts.bind,
        port = opts.port,
        version = %proxy.boot.release_version,
        partitioner = %proxy.boot.partitioner,
        "listening"
    );

    tokio::select! {
        result = server::serve(listener, proxy) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
