use std::str::FromStr;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use skiff_lib::{
    registry::{Authentication, Client},
    store::ImageStore,
    Architecture, Reference,
};
use tracing::info;

#[derive(Debug, Parser)]
pub struct Options {
    /// Image reference, e.g. `alpine:3.19` or `ghcr.io/org/app@sha256:...`
    image: String,

    /// Architecture to pull; defaults to the host's
    #[arg(long)]
    arch: Option<Architecture>,

    /// Registry username
    #[arg(long, env = "SKIFF_REGISTRY_USER")]
    username: Option<String>,

    /// Registry password
    #[arg(long, env = "SKIFF_REGISTRY_PASSWORD")]
    password: Option<String>,

    /// Store location; defaults to `$SKIFF_CACHE` then `~/.skiff`
    #[arg(long, env = "SKIFF_CACHE")]
    cache: Option<std::path::PathBuf>,
}

pub async fn main(opts: Options) -> Result<()> {
    let reference = Reference::from_str(&opts.image).context("parse image reference")?;
    let arch = match opts.arch {
        Some(arch) => arch,
        None => Architecture::host()?,
    };

    let store = match &opts.cache {
        Some(cache) => ImageStore::open(cache)?,
        None => ImageStore::open_default()?,
    };
    let auth = match (opts.username, opts.password) {
        (Some(username), Some(password)) => Authentication::basic(username, password),
        _ => Authentication::None,
    };

    let mut client = Client::new(store, auth)?;
    let image = client
        .pull_for_arch(&reference, arch)
        .await
        .with_context(|| format!("pull {reference}"))?;

    info!(dir = %image.dir.display(), "image assembled");
    let report = serde_json::json!({
        "reference": reference.to_string(),
        "architecture": arch.to_string(),
        "dir": image.dir,
        "layers": image.config.layers,
        "entrypoint": image.config.entrypoint,
        "cmd": image.config.cmd,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
