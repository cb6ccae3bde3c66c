//! Turns a parsed Dockerfile into an ordered list of layer operations.
//!
//! Each `RUN`/`COPY`/`ADD`/`WORKDIR` instruction produces one or more
//! [`LayerOp`]s with a stable cache key; runtime configuration accumulates
//! separately. Variable expansion applies to FROM, COPY/ADD paths, WORKDIR,
//! USER, STOPSIGNAL and EXPOSE, but never to RUN commands: the guest shell
//! expands its own variables.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    str::FromStr,
};

use sha2::{Digest as _, Sha256};
use tracing::debug;

use super::{CommandArgs, Dockerfile, Instruction, Vars};
use crate::{error::DockerfileError, Digest, ImageConfig, Reference, UserSpec};

/// The shell wrapped around shell-form RUN commands until SHELL overrides it.
pub const DEFAULT_SHELL: &[&str] = &["/bin/sh", "-c"];

/// Where a COPY payload comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// A path under the build context root.
    Context { path: String },

    /// A heredoc body inlined in the Dockerfile.
    Inline { name: String, body: String },
}

impl CopySource {
    /// The basename appended when the destination is a directory.
    pub fn basename(&self) -> &str {
        match self {
            CopySource::Context { path } => path.rsplit('/').next().unwrap_or(path),
            CopySource::Inline { name, .. } => name,
        }
    }

    /// Stable tag folded into the cache key.
    fn tag(&self) -> String {
        match self {
            CopySource::Context { path } => format!("ctx:{path}"),
            CopySource::Inline { name, .. } => format!("inline:{name}"),
        }
    }
}

/// One operation the build VM replays to produce a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOp {
    Run {
        argv: Vec<String>,
        env: Vec<String>,
        workdir: String,
        line: usize,
    },
    Copy {
        source: CopySource,
        dst: String,
        /// When set, the destination decision is deferred: if `dst` exists
        /// as a directory in the guest at apply time the source basename is
        /// appended, otherwise `dst` names the file itself.
        dst_may_be_dir: bool,
        chown: Option<String>,
        chmod: Option<String>,
        line: usize,
    },
}

impl LayerOp {
    /// Resolve the final destination of a COPY at apply time.
    pub fn resolved_dst(&self, dst_is_dir: bool) -> Option<String> {
        match self {
            LayerOp::Copy {
                source,
                dst,
                dst_may_be_dir,
                ..
            } => {
                if *dst_may_be_dir && dst_is_dir {
                    Some(format!("{}/{}", dst.trim_end_matches('/'), source.basename()))
                } else {
                    Some(dst.clone())
                }
            }
            LayerOp::Run { .. } => None,
        }
    }
}

/// A layer op paired with its cache key. A layer whose key already exists in
/// the store is skipped during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOp {
    pub op: LayerOp,
    pub cache_key: Digest,
}

/// The planner's output: the resolved base image, the ordered ops, and the
/// runtime configuration accumulated alongside.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    /// The FROM image string after variable expansion.
    pub from_image: String,

    /// The expanded FROM string parsed as a registry reference.
    pub base: Reference,

    pub ops: Vec<PlannedOp>,

    /// Runtime fields for the image produced by the build.
    pub config: ImageConfig,

    pub exposed_ports: Vec<String>,
    pub stop_signal: Option<String>,
    pub shell: Vec<String>,
}

/// Plans builds against a context directory.
#[derive(Debug, Clone)]
pub struct Planner {
    context_root: PathBuf,
    build_args: BTreeMap<String, String>,
}

impl Planner {
    pub fn new(context_root: impl Into<PathBuf>) -> Self {
        Self {
            context_root: context_root.into(),
            build_args: BTreeMap::new(),
        }
    }

    /// Override ARG values; these take precedence over declared defaults.
    pub fn with_build_args(mut self, args: impl IntoIterator<Item = (String, String)>) -> Self {
        self.build_args.extend(args);
        self
    }

    /// Produce the build plan for the last stage of `dockerfile`.
    #[tracing::instrument(skip_all)]
    pub fn plan(&self, dockerfile: &Dockerfile) -> Result<BuildPlan, DockerfileError> {
        let stage_starts: Vec<usize> = dockerfile
            .instructions
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p.instruction, Instruction::From { .. }))
            .map(|(i, _)| i)
            .collect();
        let Some(&first_from) = stage_starts.first() else {
            return Err(DockerfileError::MissingFrom);
        };
        let last_from = *stage_starts.last().expect("nonempty above");

        let mut vars = Vars::new();

        // ARGs before the first FROM are global and usable in FROM lines.
        for parsed in &dockerfile.instructions[..first_from] {
            match &parsed.instruction {
                Instruction::Arg { name, default } => {
                    self.declare_arg(&mut vars, name, default.as_deref())?;
                }
                _ => {
                    return Err(DockerfileError::Malformed {
                        line: parsed.line,
                        instruction: "FROM".to_string(),
                        detail: "only ARG may precede the first FROM".to_string(),
                    })
                }
            }
        }

        // Earlier stages are parsed for validity but only the last stage
        // produces output.
        let Instruction::From { image, .. } = &dockerfile.instructions[last_from].instruction
        else {
            unreachable!("stage starts are FROM instructions");
        };
        let from_image = vars.expand(image)?;
        let base = Reference::from_str(&from_image).map_err(|e| DockerfileError::Malformed {
            line: dockerfile.instructions[last_from].line,
            instruction: "FROM".to_string(),
            detail: e.to_string(),
        })?;
        debug!(%from_image, "planning last stage");

        let mut state = StageState::new(vars);
        for parsed in &dockerfile.instructions[last_from + 1..] {
            self.apply(&mut state, &parsed.instruction, parsed.line)?;
        }

        Ok(BuildPlan {
            from_image,
            base,
            ops: state.ops,
            config: ImageConfig {
                layers: Vec::new(),
                env: state.env,
                entrypoint: state.entrypoint,
                cmd: state.cmd,
                workdir: state.workdir,
                user: state.user,
                labels: state.labels,
                architecture: None,
            },
            exposed_ports: state.exposed,
            stop_signal: state.stop_signal,
            shell: state.shell,
        })
    }

    fn declare_arg(
        &self,
        vars: &mut Vars,
        name: &str,
        default: Option<&str>,
    ) -> Result<(), DockerfileError> {
        // Build-arg overrides have the highest precedence.
        let value = match self.build_args.get(name) {
            Some(value) => value.clone(),
            None => match default {
                Some(default) => vars.expand(default)?,
                None => String::new(),
            },
        };
        vars.set(name, value)
    }

    fn apply(
        &self,
        state: &mut StageState,
        instruction: &Instruction,
        line: usize,
    ) -> Result<(), DockerfileError> {
        match instruction {
            Instruction::From { .. } => unreachable!("handled by stage split"),

            Instruction::Run { args, heredoc } => {
                let argv = match (args, heredoc) {
                    (_, Some(heredoc)) => {
                        let script = if heredoc.expand {
                            state.vars.expand(&heredoc.body)?
                        } else {
                            heredoc.body.clone()
                        };
                        shell_wrap(&state.shell, &script)
                    }
                    (CommandArgs::Exec(argv), None) => argv.clone(),
                    (CommandArgs::Shell(cmd), None) => shell_wrap(&state.shell, cmd),
                };
                state.push_run(argv, line);
                Ok(())
            }

            Instruction::Workdir(dir) => {
                let dir = state.vars.expand(dir)?;
                let resolved = if dir.starts_with('/') {
                    dir
                } else {
                    format!("{}/{dir}", state.workdir.trim_end_matches('/'))
                };
                state.workdir = resolved.clone();
                let mkdir = shell_wrap(&state.shell, &format!("mkdir -p {resolved}"));
                state.push_run(mkdir, line);
                Ok(())
            }

            Instruction::Copy {
                flags,
                sources,
                dst,
                heredocs,
            } => {
                let dst = state.vars.expand(dst)?;
                let mut heredocs = heredocs.iter();
                for source in sources {
                    let source = if source.starts_with("<<") {
                        let heredoc = heredocs.next().ok_or_else(|| {
                            DockerfileError::Malformed {
                                line,
                                instruction: "COPY".to_string(),
                                detail: "heredoc marker without body".to_string(),
                            }
                        })?;
                        let body = if heredoc.expand {
                            state.vars.expand(&heredoc.body)?
                        } else {
                            heredoc.body.clone()
                        };
                        CopySource::Inline {
                            name: heredoc.delimiter.clone(),
                            body,
                        }
                    } else {
                        let path = state.vars.expand(source)?;
                        CopySource::Context {
                            path: self.context_relative(&path, line)?,
                        }
                    };
                    self.push_copy(state, source, &dst, flags.chown.clone(), flags.chmod.clone(), line)?;
                }
                Ok(())
            }

            Instruction::Add { flags, sources, dst } => {
                let dst = state.vars.expand(dst)?;
                for source in sources {
                    let path = state.vars.expand(source)?;
                    if path.starts_with("http://") || path.starts_with("https://") {
                        return Err(DockerfileError::Unsupported {
                            line,
                            instruction: "ADD".to_string(),
                            detail: format!("remote sources are not supported: {path}"),
                        });
                    }
                    // Archives are copied verbatim, never extracted.
                    let source = CopySource::Context {
                        path: self.context_relative(&path, line)?,
                    };
                    self.push_copy(state, source, &dst, flags.chown.clone(), flags.chmod.clone(), line)?;
                }
                Ok(())
            }

            Instruction::Env(pairs) => {
                for (key, value) in pairs {
                    let value = state.vars.expand(value)?;
                    state.vars.set(key, value.clone())?;
                    state.set_env(key, &value);
                }
                Ok(())
            }

            Instruction::Arg { name, default } => self.declare_arg(&mut state.vars, name, default.as_deref()),

            Instruction::User(user) => {
                state.user = UserSpec::parse(&state.vars.expand(user)?);
                Ok(())
            }
            Instruction::Cmd(args) => {
                state.cmd = match args {
                    CommandArgs::Exec(argv) => argv.clone(),
                    CommandArgs::Shell(cmd) => shell_wrap(&state.shell, cmd),
                };
                Ok(())
            }
            Instruction::Entrypoint(args) => {
                state.entrypoint = match args {
                    CommandArgs::Exec(argv) => argv.clone(),
                    CommandArgs::Shell(cmd) => shell_wrap(&state.shell, cmd),
                };
                Ok(())
            }
            Instruction::Shell(argv) => {
                state.shell = argv.clone();
                Ok(())
            }
            Instruction::StopSignal(signal) => {
                state.stop_signal = Some(state.vars.expand(signal)?);
                Ok(())
            }
            Instruction::Expose(ports) => {
                for port in ports {
                    state.exposed.push(state.vars.expand(port)?);
                }
                Ok(())
            }
            Instruction::Label(pairs) => {
                for (key, value) in pairs {
                    state.labels.insert(key.clone(), value.clone());
                }
                Ok(())
            }
        }
    }

    fn push_copy(
        &self,
        state: &mut StageState,
        source: CopySource,
        dst: &str,
        chown: Option<String>,
        chmod: Option<String>,
        line: usize,
    ) -> Result<(), DockerfileError> {
        // `dst` anchored at the current WORKDIR when relative.
        let anchored = if dst.starts_with('/') {
            dst.to_string()
        } else {
            format!("{}/{dst}", state.workdir.trim_end_matches('/'))
        };

        let (dst, dst_may_be_dir) = if let Some(stripped) = anchored.strip_suffix('/') {
            // A trailing slash makes the directory explicit.
            (format!("{stripped}/{}", source.basename()), false)
        } else {
            (anchored, true)
        };

        let payload = self.payload_digest(&source, line)?;
        let op = LayerOp::Copy {
            source,
            dst,
            dst_may_be_dir,
            chown,
            chmod,
            line,
        };
        let cache_key = copy_cache_key(&op, &payload);
        state.ops.push(PlannedOp { op, cache_key });
        Ok(())
    }

    /// Hash a COPY payload: file contents directly, directories as a sorted
    /// walk of relative paths and per-file hashes.
    fn payload_digest(&self, source: &CopySource, line: usize) -> Result<Digest, DockerfileError> {
        match source {
            CopySource::Inline { body, .. } => Ok(Digest::of_bytes(body.as_bytes())),
            CopySource::Context { path } => {
                let full = self.context_root.join(path);
                hash_path(&full).map_err(|e| DockerfileError::Malformed {
                    line,
                    instruction: "COPY".to_string(),
                    detail: format!("source {path:?}: {e}"),
                })
            }
        }
    }

    /// Resolve a COPY/ADD source against the context root, rejecting any
    /// path that would escape it.
    fn context_relative(&self, path: &str, line: usize) -> Result<String, DockerfileError> {
        let escape = || DockerfileError::PathEscape {
            line,
            path: path.replace('\0', "\\0"),
        };
        if path.contains('\0') {
            return Err(escape());
        }

        let mut components: Vec<&str> = Vec::new();
        // Absolute sources are interpreted relative to the context root;
        // anything that climbs out of it is rejected.
        for component in path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    if components.pop().is_none() {
                        return Err(escape());
                    }
                }
                other => components.push(other),
            }
        }
        if components.is_empty() {
            return Err(escape());
        }
        Ok(components.join("/"))
    }
}

struct StageState {
    vars: Vars,
    ops: Vec<PlannedOp>,
    env: Vec<String>,
    workdir: String,
    shell: Vec<String>,
    user: UserSpec,
    labels: BTreeMap<String, String>,
    cmd: Vec<String>,
    entrypoint: Vec<String>,
    exposed: Vec<String>,
    stop_signal: Option<String>,
}

impl StageState {
    fn new(vars: Vars) -> Self {
        Self {
            vars,
            ops: Vec::new(),
            env: Vec::new(),
            workdir: "/".to_string(),
            shell: DEFAULT_SHELL.iter().map(|s| s.to_string()).collect(),
            user: UserSpec::default(),
            labels: BTreeMap::new(),
            cmd: Vec::new(),
            entrypoint: Vec::new(),
            exposed: Vec::new(),
            stop_signal: None,
        }
    }

    fn set_env(&mut self, key: &str, value: &str) {
        let rendered = format!("{key}={value}");
        match self.env.iter_mut().find(|e| e.split('=').next() == Some(key)) {
            Some(existing) => *existing = rendered,
            None => self.env.push(rendered),
        }
    }

    fn push_run(&mut self, argv: Vec<String>, line: usize) {
        let op = LayerOp::Run {
            argv,
            env: self.env.clone(),
            workdir: self.workdir.clone(),
            line,
        };
        let cache_key = run_cache_key(&op);
        self.ops.push(PlannedOp { op, cache_key });
    }
}

fn shell_wrap(shell: &[String], cmd: &str) -> Vec<String> {
    shell.iter().cloned().chain([cmd.to_string()]).collect()
}

/// Stable key over `(argv, env, workdir)`; NUL-separated fields defeat
/// concatenation collisions.
fn run_cache_key(op: &LayerOp) -> Digest {
    let LayerOp::Run { argv, env, workdir, .. } = op else {
        unreachable!("run key of copy op");
    };
    let mut hasher = Sha256::new();
    hasher.update(b"run\0");
    for arg in argv {
        hasher.update(arg.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(b"env\0");
    for pair in env {
        hasher.update(pair.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(b"wd\0");
    hasher.update(workdir.as_bytes());
    Digest::from_hash(hasher.finalize().to_vec())
}

/// Stable key over `(source tag, dst, payload digest)`.
fn copy_cache_key(op: &LayerOp, payload: &Digest) -> Digest {
    let LayerOp::Copy { source, dst, .. } = op else {
        unreachable!("copy key of run op");
    };
    let mut hasher = Sha256::new();
    hasher.update(b"copy\0");
    hasher.update(source.tag().as_bytes());
    hasher.update(b"\0");
    hasher.update(dst.as_bytes());
    hasher.update(b"\0");
    hasher.update(&payload.hash);
    Digest::from_hash(hasher.finalize().to_vec())
}

fn hash_path(path: &Path) -> std::io::Result<Digest> {
    let meta = std::fs::metadata(path)?;
    if meta.is_file() {
        let content = std::fs::read(path)?;
        return Ok(Digest::of_bytes(&content));
    }

    // Directories hash as a sorted walk of (relative path, content hash).
    let mut hasher = Sha256::new();
    let mut stack = vec![PathBuf::new()];
    while let Some(rel) = stack.pop() {
        let dir = path.join(&rel);
        let mut children: Vec<_> = std::fs::read_dir(&dir)?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|e| e.file_name())
            .collect();
        children.sort();
        for name in children {
            let child_rel = rel.join(&name);
            let child = path.join(&child_rel);
            if child.is_dir() {
                stack.push(child_rel);
            } else {
                let content = std::fs::read(&child)?;
                hasher.update(child_rel.to_string_lossy().as_bytes());
                hasher.update(b"\0");
                hasher.update(Sha256::digest(&content));
            }
        }
    }
    Ok(Digest::from_hash(hasher.finalize().to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn plan_str(source: &str, context: &Path) -> Result<BuildPlan, DockerfileError> {
        let dockerfile = Dockerfile::parse(source)?;
        Planner::new(context).plan(&dockerfile)
    }

    #[test]
    fn from_expansion_resolves_reference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = "ARG VERSION=3.19\nFROM alpine:$VERSION\n";
        let plan = plan_str(source, dir.path()).expect("plan");
        assert_eq!(plan.from_image, "alpine:3.19");
        assert_eq!(plan.base.to_string(), "docker.io/library/alpine:3.19");
    }

    #[test]
    fn build_args_have_highest_precedence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dockerfile =
            Dockerfile::parse("ARG VERSION=3.19\nFROM alpine:$VERSION\n").expect("parse");
        let plan = Planner::new(dir.path())
            .with_build_args([("VERSION".to_string(), "edge".to_string())])
            .plan(&dockerfile)
            .expect("plan");
        assert_eq!(plan.from_image, "alpine:edge");
    }

    #[test]
    fn run_commands_are_not_expanded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = plan_str("FROM a\nENV NAME=world\nRUN echo $NAME\n", dir.path()).expect("plan");
        let LayerOp::Run { argv, env, .. } = &plan.ops[0].op else {
            panic!("expected run op");
        };
        // The guest shell expands its own variables.
        assert_eq!(argv, &["/bin/sh", "-c", "echo $NAME"]);
        assert_eq!(env, &["NAME=world"]);
    }

    #[test]
    fn workdir_emits_mkdir_and_anchors_relatives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = plan_str("FROM a\nWORKDIR /srv\nWORKDIR logs\n", dir.path()).expect("plan");
        assert_eq!(plan.config.workdir, "/srv/logs");
        let LayerOp::Run { argv, .. } = &plan.ops[1].op else {
            panic!("expected run op");
        };
        assert_eq!(argv[2], "mkdir -p /srv/logs");
    }

    #[test]
    fn copy_with_trailing_slash_appends_basename() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), b"{}").expect("write");

        let plan = plan_str("FROM a\nCOPY config.json /etc/app/\n", dir.path()).expect("plan");
        let LayerOp::Copy { dst, dst_may_be_dir, .. } = &plan.ops[0].op else {
            panic!("expected copy op");
        };
        assert_eq!(dst, "/etc/app/config.json");
        assert!(!dst_may_be_dir);
    }

    #[test]
    fn copy_destination_defers_to_apply_time() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("config.json"), b"{}").expect("write");

        let plan = plan_str("FROM a\nCOPY config.json /opt\n", dir.path()).expect("plan");
        let op = &plan.ops[0].op;
        // With /opt present as a directory the file lands inside it;
        // otherwise /opt names the file.
        assert_eq!(op.resolved_dst(true), Some("/opt/config.json".to_string()));
        assert_eq!(op.resolved_dst(false), Some("/opt".to_string()));
    }

    #[test]
    fn copy_sources_cannot_escape_the_context() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = plan_str("FROM a\nCOPY ../secrets /etc/\n", dir.path()).expect_err("must fail");
        assert!(matches!(err, DockerfileError::PathEscape { line: 2, .. }));
    }

    #[test]
    fn add_urls_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = plan_str(
            "FROM a\nADD https://example.com/x.tar /tmp/\n",
            dir.path(),
        )
        .expect_err("must fail");
        assert!(matches!(err, DockerfileError::Unsupported { .. }));
    }

    #[test]
    fn run_cache_keys_are_stable_and_sensitive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = "FROM a\nRUN echo hi\n";
        let a = plan_str(source, dir.path()).expect("plan");
        let b = plan_str(source, dir.path()).expect("plan");
        assert_eq!(a.ops[0].cache_key, b.ops[0].cache_key);

        // A changed environment invalidates the key.
        let c = plan_str("FROM a\nENV X=1\nRUN echo hi\n", dir.path()).expect("plan");
        assert_ne!(a.ops[0].cache_key, c.ops[0].cache_key);
    }

    #[test]
    fn copy_cache_key_tracks_payload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = "FROM a\nCOPY data.bin /data\n";

        std::fs::write(dir.path().join("data.bin"), b"one").expect("write");
        let a = plan_str(source, dir.path()).expect("plan");

        std::fs::write(dir.path().join("data.bin"), b"two").expect("write");
        let b = plan_str(source, dir.path()).expect("plan");
        assert_ne!(a.ops[0].cache_key, b.ops[0].cache_key);
    }

    #[test]
    fn heredoc_copy_inlines_the_body() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = "FROM a\nCOPY <<config.toml /etc/app/\nkey = 1\nconfig.toml\n";
        let plan = plan_str(source, dir.path()).expect("plan");
        let LayerOp::Copy { source, dst, .. } = &plan.ops[0].op else {
            panic!("expected copy op");
        };
        assert_eq!(
            source,
            &CopySource::Inline {
                name: "config.toml".into(),
                body: "key = 1\n".into()
            }
        );
        assert_eq!(dst, "/etc/app/config.toml");
    }

    #[test]
    fn runtime_config_accumulates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = "FROM a\nENV A=1\nUSER 1000:100\nLABEL team=infra\nEXPOSE 80\nSTOPSIGNAL SIGTERM\nENTRYPOINT [\"/srv/app\"]\nCMD [\"--serve\"]\n";
        let plan = plan_str(source, dir.path()).expect("plan");

        assert_eq!(plan.config.env, vec!["A=1"]);
        assert_eq!(plan.config.user.uid, Some(1000));
        assert_eq!(plan.config.labels["team"], "infra");
        assert_eq!(plan.exposed_ports, vec!["80"]);
        assert_eq!(plan.stop_signal.as_deref(), Some("SIGTERM"));
        assert_eq!(plan.config.entrypoint, vec!["/srv/app"]);
        assert_eq!(plan.config.cmd, vec!["--serve"]);
    }

    #[test]
    fn missing_from_is_typed() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            plan_str("RUN echo hi\n", dir.path()).expect_err("must fail"),
            DockerfileError::MissingFrom
        );
    }

    #[test]
    fn only_the_last_stage_produces_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = "FROM golang AS build\nRUN go build\nFROM alpine\nRUN echo done\n";
        let plan = plan_str(source, dir.path()).expect("plan");
        assert_eq!(plan.ops.len(), 1);
        let LayerOp::Run { argv, .. } = &plan.ops[0].op else {
            panic!("expected run op");
        };
        assert_eq!(argv[2], "echo done");
    }
}
