//! Lowers a parsed Dockerfile into the operation stream consumed by the solver.
//!
//! Every stage becomes a chain: the base (`pull`, or `extract` for an earlier
//! stage) followed by one operation per instruction. Each operation consumes
//! the previous operation's output, and output names are derived from content
//! so that cache keys chain through the whole stage.

use crate::builder::cache::hash::sha256_hex;
use crate::builder::parser::{
    parse_dockerfile, BuildStage, Dockerfile, HealthcheckConfig, Instruction, ParseError,
    RunCommand,
};
use crate::config::BuildConfig;
use crate::types::{Operation, OperationType, Platform};
use std::collections::{BTreeMap, BTreeSet};

/// Prefix for inputs that come from the build context.
pub const CONTEXT_INPUT_PREFIX: &str = "context://";
/// Prefix for inputs that come from a registry image.
pub const IMAGE_INPUT_PREFIX: &str = "image://";

const DEFAULT_SHELL: [&str; 2] = ["/bin/sh", "-c"];

/// Parses Dockerfile text and lowers it into operations.
///
/// Pure: identical text and config yield identical operations in identical
/// order. All operations target the first effective platform of `config`;
/// the orchestrator retargets copies for the remaining platforms.
pub fn parse(text: &str, config: &BuildConfig) -> Result<Vec<Operation>, ParseError> {
    let dockerfile = parse_dockerfile(text)?;
    let platform = config
        .effective_platforms()
        .into_iter()
        .next()
        .unwrap_or_else(Platform::host);
    Lowering::new(&dockerfile, config, platform).lower()
}

/// Where a stage's base comes from.
#[derive(Debug, Clone, PartialEq)]
enum StageBase {
    Image(String),
    Stage(usize),
}

/// A stage with its base and cross-stage references resolved.
struct ResolvedStage<'a> {
    stage: &'a BuildStage,
    label: String,
    base: StageBase,
    /// Resolved `COPY --from` references keyed by instruction index.
    copy_sources: BTreeMap<usize, usize>,
}

struct Lowering<'a> {
    dockerfile: &'a Dockerfile,
    config: &'a BuildConfig,
    platform: Platform,
    global_scope: BTreeMap<String, String>,
}

impl<'a> Lowering<'a> {
    fn new(dockerfile: &'a Dockerfile, config: &'a BuildConfig, platform: Platform) -> Self {
        let mut global_scope = BTreeMap::new();
        for (name, default) in &dockerfile.global_args {
            if let Some(value) = config.build_args.get(name).or(default.as_ref()) {
                global_scope.insert(name.clone(), value.clone());
            }
        }

        Self { dockerfile, config, platform, global_scope }
    }

    fn lower(&self) -> Result<Vec<Operation>, ParseError> {
        let resolved = self.resolve_stages()?;
        let selected = self.select_stages(&resolved)?;

        let mut operations = Vec::new();
        let mut finished: BTreeMap<usize, FinishedStage> = BTreeMap::new();

        for index in selected {
            let state = self.lower_stage(&resolved[index], &resolved, &finished)?;
            if let Some(last) = state.operations.last().and_then(|op| op.outputs.first()) {
                finished.insert(
                    index,
                    FinishedStage {
                        output: last.clone(),
                        env: state.env.clone(),
                        work_dir: state.work_dir.clone(),
                        shell: state.shell.clone(),
                    },
                );
            }
            operations.extend(state.operations);
        }

        Ok(operations)
    }

    /// Resolves every stage's base and `COPY --from` references.
    fn resolve_stages(&self) -> Result<Vec<ResolvedStage<'a>>, ParseError> {
        let names: Vec<Option<&str>> =
            self.dockerfile.stages.iter().map(|s| s.name.as_deref()).collect();

        let lookup = |reference: &str| -> Option<usize> {
            let reference = reference.to_lowercase();
            names
                .iter()
                .position(|n| n.map(|n| n == reference).unwrap_or(false))
                .or_else(|| reference.parse::<usize>().ok().filter(|i| *i < names.len()))
        };

        let mut resolved = Vec::with_capacity(self.dockerfile.stages.len());

        for (index, stage) in self.dockerfile.stages.iter().enumerate() {
            let from_line = stage.instructions.first().map(|i| i.line).unwrap_or(0);
            let image = expand_strict(&stage.from, &self.global_scope, from_line)?;
            if image.is_empty() {
                return Err(ParseError::new(from_line, "FROM image expands to an empty string"));
            }

            // Numeric references are only valid for --from, not for FROM.
            let base_stage = names
                .iter()
                .position(|n| n.map(|n| n == image.to_lowercase()).unwrap_or(false));
            let base = match base_stage {
                Some(target) if target >= index => {
                    return Err(ParseError::new(
                        from_line,
                        format!("Cyclic stage reference: stage {} is based on '{}'", index, image),
                    )
                    .with_hint("A stage can only build on stages defined before it"));
                }
                Some(target) => StageBase::Stage(target),
                None => StageBase::Image(normalize_image_ref(&image)),
            };

            let mut copy_sources = BTreeMap::new();
            for (pos, step) in stage.instructions.iter().enumerate() {
                let Instruction::Copy { from_stage: Some(reference), .. } = &step.instruction else {
                    continue;
                };
                let reference = expand(reference, &self.global_scope);
                match lookup(&reference) {
                    Some(target) if target >= index => {
                        return Err(ParseError::new(
                            step.line,
                            format!("Cyclic stage reference: COPY --from={} in stage {}", reference, index),
                        )
                        .with_hint("COPY --from can only name stages defined before it"));
                    }
                    Some(target) => {
                        copy_sources.insert(pos, target);
                    }
                    None => {
                        return Err(ParseError::new(
                            step.line,
                            format!("Unresolved COPY --from={}", reference),
                        )
                        .with_hint("Name an earlier stage (FROM ... AS <name>) or its index"));
                    }
                }
            }

            resolved.push(ResolvedStage {
                stage,
                label: stage.name.clone().unwrap_or_else(|| index.to_string()),
                base,
                copy_sources,
            });
        }

        Ok(resolved)
    }

    /// Stage indices to lower, in source order.
    ///
    /// Without a target every stage is built. With a target, stages after it
    /// are dropped along with any earlier stage it does not reach.
    fn select_stages(&self, resolved: &[ResolvedStage<'_>]) -> Result<Vec<usize>, ParseError> {
        let Some(target) = &self.config.target else {
            return Ok((0..resolved.len()).collect());
        };

        let target = target.to_lowercase();
        let end = resolved
            .iter()
            .position(|r| r.stage.name.as_deref() == Some(target.as_str()))
            .ok_or_else(|| {
                ParseError::new(0, format!("Target stage '{}' not found", target))
                    .with_hint("Use a name given with FROM ... AS <name>")
            })?;

        let mut reachable = BTreeSet::new();
        let mut stack = vec![end];
        while let Some(index) = stack.pop() {
            if !reachable.insert(index) {
                continue;
            }
            let stage = &resolved[index];
            if let StageBase::Stage(base) = stage.base {
                stack.push(base);
            }
            stack.extend(stage.copy_sources.values().copied());
        }

        Ok(reachable.into_iter().collect())
    }

    fn lower_stage(
        &self,
        resolved: &ResolvedStage<'_>,
        all: &[ResolvedStage<'_>],
        finished: &BTreeMap<usize, FinishedStage>,
    ) -> Result<StageState, ParseError> {
        let mut state = StageState::new(&resolved.label, self.platform.clone());
        // A stage built on an earlier stage starts from that stage's config
        if let StageBase::Stage(base) = resolved.base {
            if let Some(parent) = finished.get(&base) {
                state.env = parent.env.clone();
                state.work_dir = parent.work_dir.clone();
                state.shell = parent.shell.clone();
            }
        }

        // Base
        let mut base_metadata = BTreeMap::new();
        if let Some(flag) = &resolved.stage.platform {
            base_metadata.insert("from_platform".to_string(), expand(flag, &self.global_scope));
        }
        match &resolved.base {
            StageBase::Image(image) => state.push(
                OperationType::Pull,
                vec!["FROM".into(), image.clone()],
                vec![format!("{}{}", IMAGE_INPUT_PREFIX, image)],
                base_metadata,
            ),
            StageBase::Stage(base) => {
                let input = stage_output(finished, *base, all)?;
                base_metadata.insert("base_stage".into(), all[*base].label.clone());
                state.push(
                    OperationType::Extract,
                    vec!["FROM".into(), all[*base].label.clone()],
                    vec![input],
                    base_metadata,
                )
            }
        }

        for (pos, step) in resolved.stage.instructions.iter().enumerate().skip(1) {
            let line = step.line;
            match &step.instruction {
                Instruction::From { .. } => {
                    return Err(ParseError::new(line, "Unexpected FROM inside a stage"));
                }

                Instruction::Arg { name, default } => {
                    let value = self
                        .config
                        .build_args
                        .get(name)
                        .cloned()
                        .or_else(|| default.as_ref().map(|d| expand(d, &state.scope())))
                        .or_else(|| self.global_scope.get(name).cloned());
                    match value {
                        Some(value) => {
                            state.args.insert(name.clone(), value);
                        }
                        None => {
                            state.args.remove(name);
                        }
                    }
                }

                Instruction::Run { command } => {
                    let mut argv = vec!["RUN".to_string()];
                    let mut metadata = BTreeMap::new();
                    match command {
                        RunCommand::Shell(cmd) => {
                            argv.extend(state.shell.iter().cloned());
                            argv.push(cmd.clone());
                            metadata.insert("form".into(), "shell".into());
                        }
                        RunCommand::Exec(args) => {
                            argv.extend(args.iter().cloned());
                            metadata.insert("form".into(), "exec".into());
                        }
                    }
                    if !state.args.is_empty() {
                        metadata.insert("build_args".into(), encode_map(&state.args));
                    }
                    state.push_exec(argv, metadata);
                }

                Instruction::Copy { sources, destination, chown, chmod, .. } => {
                    let scope = state.scope();
                    let sources: Vec<String> = sources.iter().map(|s| expand(s, &scope)).collect();
                    let destination = state.resolve_path(&expand(destination, &scope));

                    let mut command = vec!["COPY".to_string()];
                    command.extend(sources.iter().cloned());
                    command.push(destination);

                    let mut metadata = file_metadata(chown.as_deref(), chmod.as_deref(), &scope);
                    let inputs = match resolved.copy_sources.get(&pos) {
                        Some(source) => {
                            metadata.insert("from".into(), all[*source].label.clone());
                            vec![stage_output(finished, *source, all)?]
                        }
                        None => sources
                            .iter()
                            .map(|s| format!("{}{}", CONTEXT_INPUT_PREFIX, s))
                            .collect(),
                    };
                    state.push(OperationType::File, command, inputs, metadata);
                }

                Instruction::Add { sources, destination, chown, chmod } => {
                    let scope = state.scope();
                    let sources: Vec<String> = sources.iter().map(|s| expand(s, &scope)).collect();
                    let destination = state.resolve_path(&expand(destination, &scope));

                    let mut command = vec!["ADD".to_string()];
                    command.extend(sources.iter().cloned());
                    command.push(destination);

                    let mut metadata = file_metadata(chown.as_deref(), chmod.as_deref(), &scope);
                    // Remote sources are fetched by the executor
                    let (remote, local): (Vec<&String>, Vec<&String>) =
                        sources.iter().partition(|s| is_remote(s));
                    if !remote.is_empty() {
                        metadata.insert("remote".into(), "true".into());
                    }
                    let inputs =
                        local.iter().map(|s| format!("{}{}", CONTEXT_INPUT_PREFIX, s)).collect();
                    state.push(OperationType::File, command, inputs, metadata);
                }

                Instruction::Env { vars } => {
                    let mut command = vec!["ENV".to_string()];
                    for (key, value) in vars {
                        let value = expand(value, &state.scope());
                        command.push(format!("{}={}", key, value));
                        state.env.insert(key.clone(), value);
                    }
                    state.push_meta(command);
                }

                Instruction::Label { labels } => {
                    let scope = state.scope();
                    let mut command = vec!["LABEL".to_string()];
                    command.extend(
                        labels.iter().map(|(k, v)| format!("{}={}", expand(k, &scope), expand(v, &scope))),
                    );
                    state.push_meta(command);
                }

                Instruction::Expose { ports } => {
                    let scope = state.scope();
                    let mut command = vec!["EXPOSE".to_string()];
                    for port in ports {
                        command.push(normalize_port(&expand(port, &scope), line)?);
                    }
                    state.push_meta(command);
                }

                Instruction::Workdir { path } => {
                    let path = state.resolve_path(&expand(path, &state.scope()));
                    state.work_dir = path.clone();
                    state.push_meta(vec!["WORKDIR".into(), path]);
                }

                Instruction::User { user } => {
                    let user = expand(user, &state.scope());
                    state.push_meta(vec!["USER".into(), user]);
                }

                Instruction::Volume { paths } => {
                    let scope = state.scope();
                    let mut command = vec!["VOLUME".to_string()];
                    command.extend(paths.iter().map(|p| expand(p, &scope)));
                    state.push_meta(command);
                }

                Instruction::Entrypoint { command } => {
                    state.push_meta(render_command("ENTRYPOINT", command));
                }

                Instruction::Cmd { command } => {
                    state.push_meta(render_command("CMD", command));
                }

                Instruction::Healthcheck { config } => {
                    state.push_meta(render_healthcheck(config.as_ref()));
                }

                Instruction::Stopsignal { signal } => {
                    let signal = expand(signal, &state.scope());
                    state.push_meta(vec!["STOPSIGNAL".into(), signal]);
                }

                Instruction::Shell { shell } => {
                    state.shell = shell.clone();
                    let mut command = vec!["SHELL".to_string()];
                    command.extend(shell.iter().cloned());
                    state.push_meta(command);
                }
            }
        }

        Ok(state)
    }
}

/// What a lowered stage hands to the stages built on it.
struct FinishedStage {
    output: String,
    env: BTreeMap<String, String>,
    work_dir: String,
    shell: Vec<String>,
}

/// Per-stage lowering state.
struct StageState {
    label: String,
    platform: Platform,
    args: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    work_dir: String,
    shell: Vec<String>,
    operations: Vec<Operation>,
}

impl StageState {
    fn new(label: &str, platform: Platform) -> Self {
        Self {
            label: label.to_string(),
            platform,
            args: BTreeMap::new(),
            env: BTreeMap::new(),
            work_dir: "/".to_string(),
            shell: DEFAULT_SHELL.iter().map(|s| s.to_string()).collect(),
            operations: Vec::new(),
        }
    }

    /// Variables visible to expansion; ENV shadows ARG.
    fn scope(&self) -> BTreeMap<String, String> {
        let mut scope = self.args.clone();
        scope.extend(self.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        scope
    }

    fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else if self.work_dir.ends_with('/') {
            format!("{}{}", self.work_dir, path)
        } else {
            format!("{}/{}", self.work_dir, path)
        }
    }

    fn push_meta(&mut self, command: Vec<String>) {
        self.push(OperationType::Meta, command, Vec::new(), BTreeMap::new());
    }

    fn push_exec(&mut self, command: Vec<String>, metadata: BTreeMap<String, String>) {
        self.push(OperationType::Exec, command, Vec::new(), metadata);
        // RUN sees build args as environment; ENV wins on conflict
        let scope = self.scope();
        if let Some(op) = self.operations.last_mut() {
            op.env = scope;
        }
    }

    /// Appends an operation chained onto the previous one.
    fn push(
        &mut self,
        op_type: OperationType,
        command: Vec<String>,
        extra_inputs: Vec<String>,
        mut metadata: BTreeMap<String, String>,
    ) {
        let step = self.operations.len();
        metadata.insert("stage".into(), self.label.clone());

        let mut inputs: Vec<String> =
            self.operations.last().map(|op| op.outputs.clone()).unwrap_or_default();
        inputs.extend(extra_inputs);

        let digest = output_digest(op_type, &command, &inputs, &metadata);
        let output = format!("{}/{}:{}", self.label, step, &digest[..12]);

        let mut op = Operation::new(op_type, command, self.platform.clone());
        op.inputs = inputs;
        op.outputs = vec![output];
        op.work_dir = self.work_dir.clone();
        op.env = self.env.clone();
        op.metadata = metadata;
        self.operations.push(op);
    }
}

/// Content digest of an operation, independent of platform.
fn output_digest(
    op_type: OperationType,
    command: &[String],
    inputs: &[String],
    metadata: &BTreeMap<String, String>,
) -> String {
    let material = serde_json::json!({
        "type": op_type,
        "command": command,
        "inputs": inputs,
        "metadata": metadata,
    });
    sha256_hex(material.to_string().as_bytes())
}

fn stage_output(
    finished: &BTreeMap<usize, FinishedStage>,
    index: usize,
    all: &[ResolvedStage<'_>],
) -> Result<String, ParseError> {
    finished.get(&index).map(|f| f.output.clone()).ok_or_else(|| {
        let line = all[index].stage.instructions.first().map(|i| i.line).unwrap_or(0);
        ParseError::new(line, format!("Stage '{}' produced no output", all[index].label))
    })
}

fn file_metadata(
    chown: Option<&str>,
    chmod: Option<&str>,
    scope: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut metadata = BTreeMap::new();
    if let Some(chown) = chown {
        metadata.insert("chown".into(), expand(chown, scope));
    }
    if let Some(chmod) = chmod {
        metadata.insert("chmod".into(), expand(chmod, scope));
    }
    metadata
}

fn render_command(keyword: &str, command: &RunCommand) -> Vec<String> {
    let mut argv = vec![keyword.to_string()];
    match command {
        RunCommand::Shell(cmd) => {
            argv.extend(DEFAULT_SHELL.iter().map(|s| s.to_string()));
            argv.push(cmd.clone());
        }
        RunCommand::Exec(args) => argv.extend(args.iter().cloned()),
    }
    argv
}

fn render_healthcheck(config: Option<&HealthcheckConfig>) -> Vec<String> {
    let Some(config) = config else {
        return vec!["HEALTHCHECK".into(), "NONE".into()];
    };

    let mut argv = vec!["HEALTHCHECK".to_string()];
    let flags = [
        ("interval", config.interval.clone()),
        ("timeout", config.timeout.clone()),
        ("start-period", config.start_period.clone()),
        ("retries", config.retries.map(|r| r.to_string())),
    ];
    for (name, value) in flags {
        if let Some(value) = value {
            argv.push(format!("--{}={}", name, value));
        }
    }
    argv.extend(render_command("CMD", &config.command));
    argv
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

/// Adds `:latest` when a reference carries neither tag nor digest.
fn normalize_image_ref(image: &str) -> String {
    if image == "scratch" || image.contains('@') {
        return image.to_string();
    }
    let last = image.rsplit('/').next().unwrap_or(image);
    if last.contains(':') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Validates `port[/proto]` and fills in the default protocol.
fn normalize_port(spec: &str, line: usize) -> Result<String, ParseError> {
    let (port, protocol) = spec.split_once('/').unwrap_or((spec, "tcp"));
    let protocol = protocol.to_lowercase();
    if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
        return Err(ParseError::new(line, format!("Invalid protocol: {}", protocol))
            .with_hint("Use tcp, udp or sctp"));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(format!("{}/{}", p, protocol)),
        _ => Err(ParseError::new(line, format!("Invalid port: {}", port))),
    }
}

fn encode_map(map: &BTreeMap<String, String>) -> String {
    map.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

/// Expands variables, treating undefined ones as empty.
fn expand(input: &str, scope: &BTreeMap<String, String>) -> String {
    expand_vars(input, scope).0
}

/// Expands variables and fails if one is undefined and has no fallback.
fn expand_strict(
    input: &str,
    scope: &BTreeMap<String, String>,
    line: usize,
) -> Result<String, ParseError> {
    let (expanded, missing) = expand_vars(input, scope);
    match missing.first() {
        None => Ok(expanded),
        Some(name) => Err(ParseError::new(
            line,
            format!("Undefined ARG '{}' used in FROM", name),
        )
        .with_hint(format!("Declare ARG {}=<default> before FROM or pass --build-arg {}=<value>", name, name))),
    }
}

/// Expands `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR:+alternate}`.
///
/// `\$` yields a literal dollar sign. Returns the expansion and the names of
/// referenced variables that were undefined with no default.
fn expand_vars(input: &str, scope: &BTreeMap<String, String>) -> (String, Vec<String>) {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut missing = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\\' && chars.get(i + 1) == Some(&'$') {
            out.push('$');
            i += 2;
            continue;
        }

        if c != '$' {
            out.push(c);
            i += 1;
            continue;
        }

        if chars.get(i + 1) == Some(&'{') {
            let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') else {
                // Unbalanced brace: keep literally
                out.extend(&chars[i..]);
                break;
            };
            let body: String = chars[i + 2..i + 2 + close].iter().collect();
            i += close + 3;

            if let Some((name, default)) = body.split_once(":-") {
                match scope.get(name).filter(|v| !v.is_empty()) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&expand_vars(default, scope).0),
                }
            } else if let Some((name, alternate)) = body.split_once(":+") {
                if scope.get(name).map(|v| !v.is_empty()).unwrap_or(false) {
                    out.push_str(&expand_vars(alternate, scope).0);
                }
            } else {
                match scope.get(&body) {
                    Some(value) => out.push_str(value),
                    None => missing.push(body),
                }
            }
            continue;
        }

        let name: String = chars[i + 1..]
            .iter()
            .take_while(|c| c.is_ascii_alphanumeric() || **c == '_')
            .collect();
        if name.is_empty() {
            out.push('$');
            i += 1;
            continue;
        }
        i += 1 + name.chars().count();
        match scope.get(&name) {
            Some(value) => out.push_str(value),
            None => missing.push(name),
        }
    }

    (out, missing)
}
