use std::str::FromStr;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use skiff_lib::{store::ImageStore, Reference};
use tap::Pipe;

#[derive(Debug, Parser)]
pub struct Options {
    /// Image reference previously fetched with `skiff pull`
    image: String,

    /// Store location; defaults to `$SKIFF_CACHE` then `~/.skiff`
    #[arg(long, env = "SKIFF_CACHE")]
    cache: Option<std::path::PathBuf>,

    /// Print one merged listing instead of per-layer contents
    #[arg(long)]
    merged: bool,
}

pub async fn main(opts: Options) -> Result<()> {
    let reference = Reference::from_str(&opts.image).context("parse image reference")?;
    let store = match &opts.cache {
        Some(cache) => ImageStore::open(cache)?,
        None => ImageStore::open_default()?,
    };
    let image = store
        .image_dir(&reference)
        .pipe(|dir| store.load(dir))
        .with_context(|| format!("load {reference}; run `skiff pull` first"))?;

    if opts.merged {
        let fs = image.filesystem()?;
        let mut pending = vec!["/".to_string()];
        while let Some(dir) = pending.pop() {
            for entry in fs.read_dir(&dir)? {
                let path = format!("{}/{}", dir.trim_end_matches('/'), entry.name);
                println!("{path}");
                if entry.kind == skiff_lib::archive::EntryKind::Dir {
                    pending.push(path);
                }
            }
        }
        return Ok(());
    }

    for (digest, layer) in image.config.layers.iter().zip(image.open_layers()?) {
        println!("{digest}:");
        for entry in layer.entries() {
            println!("  {:?} {}", entry.kind, entry.path);
        }
    }
    Ok(())
}
