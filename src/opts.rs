//! Process configuration: command-line flags and the secure connection
//! bundle that points at the backend cluster.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{Error, Result};

pub const USAGE: &str = "usage: cql-proxy --bundle|-b <path> --username|-u <user> \
     --password|-p <pass> [--bind|-n <ip>] [--port|-t <port>]";

#[derive(Debug, Clone)]
pub struct Opts {
    /// Address the proxy listens on
    pub bind: String,
    /// Port the proxy listens on
    pub port: u16,
    /// Path to the secure connection bundle
    pub bundle: PathBuf,
    pub username: String,
    pub password: String,
}

impl Opts {
    /// Parse command-line flags (program name already stripped).
    pub fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut bind = "127.0.0.1".to_string();
        let mut port = 9042u16;
        let mut bundle = None;
        let mut username = None;
        let mut password = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--bundle" | "-b" => bundle = Some(PathBuf::from(value(&mut args, &arg)?)),
                "--username" | "-u" => username = Some(value(&mut args, &arg)?),
                "--password" | "-p" => password = Some(value(&mut args, &arg)?),
                "--bind" | "-n" => bind = value(&mut args, &arg)?,
                "--port" | "-t" => {
                    let raw = value(&mut args, &arg)?;
                    port = raw
                        .parse()
                        .ok()
                        .filter(|p| *p != 0)
                        .ok_or_else(|| Error::BadConfig(format!("Port is invalid: {raw}")))?;
                }
                other => {
                    return Err(Error::BadConfig(format!("Unknown argument: {other}")));
                }
            }
        }

        match (bundle, username, password) {
            (Some(bundle), Some(username), Some(password)) => Ok(Self {
                bind,
                port,
                bundle,
                username,
                password,
            }),
            _ => Err(Error::BadConfig(
                "--bundle, --username and --password are required".to_string(),
            )),
        }
    }
}

fn value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
    args.next()
        .ok_or_else(|| Error::BadConfig(format!("Missing value for {flag}")))
}

/// The secure connection bundle names the backend contact point; the
/// credentials come from the command line.
#[derive(Debug, Clone, Deserialize)]
pub struct Bundle {
    pub host: String,
    pub port: u16,
}

pub fn load_bundle(path: &Path) -> Result<Bundle> {
    let data = std::fs::read_to_string(path).map_err(|err| {
        Error::BadConfig(format!(
            "Unable to read the secure connection bundle {}: {err}",
            path.display()
        ))
    })?;
    serde_json::from_str(&data).map_err(|err| {
        Error::BadConfig(format!(
            "Unable to parse the secure connection bundle {}: {err}",
            path.display()
        ))
    })
}
