use std::path::PathBuf;

use clap::Parser;
use color_eyre::eyre::{eyre, Context, Result};
use skiff_lib::dockerfile::{CopySource, Dockerfile, LayerOp, Planner};

#[derive(Debug, Parser)]
pub struct Options {
    /// Path to the Dockerfile
    #[arg(default_value = "Dockerfile")]
    dockerfile: PathBuf,

    /// Build context root; defaults to the Dockerfile's directory
    #[arg(long)]
    context: Option<PathBuf>,

    /// Build arguments as NAME=value
    #[arg(long = "build-arg")]
    build_args: Vec<String>,
}

pub async fn main(opts: Options) -> Result<()> {
    let source = tokio::fs::read_to_string(&opts.dockerfile)
        .await
        .with_context(|| format!("read {}", opts.dockerfile.display()))?;
    let context = match opts.context {
        Some(context) => context,
        None => opts
            .dockerfile
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
    };

    let build_args = opts
        .build_args
        .iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| eyre!("build arg must be NAME=value: {arg}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let dockerfile = Dockerfile::parse(&source)?;
    let plan = Planner::new(context)
        .with_build_args(build_args)
        .plan(&dockerfile)?;

    println!("base: {}", plan.base);
    for (index, planned) in plan.ops.iter().enumerate() {
        let key = &planned.cache_key.as_hex()[..12];
        match &planned.op {
            LayerOp::Run { argv, workdir, .. } => {
                println!("{index:3} {key} RUN  [{workdir}] {}", argv.join(" "));
            }
            LayerOp::Copy { source, dst, .. } => {
                let source = match source {
                    CopySource::Context { path } => path.clone(),
                    CopySource::Inline { name, .. } => format!("<<{name}"),
                };
                println!("{index:3} {key} COPY {source} -> {dst}");
            }
        }
    }

    if !plan.config.cmd.is_empty() {
        println!("cmd: {}", plan.config.cmd.join(" "));
    }
    if !plan.config.entrypoint.is_empty() {
        println!("entrypoint: {}", plan.config.entrypoint.join(" "));
    }
    Ok(())
}
