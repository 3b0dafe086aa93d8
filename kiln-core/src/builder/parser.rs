//! Dockerfile parser for the kiln build system.
//!
//! Parses Dockerfiles into a structured, syntax-level representation. Variable
//! references (`$VAR`, `${VAR:-default}`) are kept verbatim here; the frontend
//! expands them once build arguments are known. Supports:
//! - The canonical instruction set plus STOPSIGNAL and SHELL
//! - Multi-stage builds (`FROM ... AS name`, `COPY --from=`)
//! - Global ARG declarations before the first FROM
//! - Line continuations and full-line comments

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Represents a complete Dockerfile with all its stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Dockerfile {
    /// Build stages (may be multiple for multi-stage builds)
    pub stages: Vec<BuildStage>,
    /// Global ARG declarations (before first FROM)
    pub global_args: BTreeMap<String, Option<String>>,
}

/// A single build stage in a Dockerfile.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildStage {
    /// Stage name (from `FROM ... AS name`)
    pub name: Option<String>,
    /// Unexpanded base reference as written after FROM
    pub from: String,
    /// `--platform` flag of the FROM line
    pub platform: Option<String>,
    /// Instructions in this stage, starting with its FROM
    pub instructions: Vec<StageInstruction>,
}

/// An instruction together with the line it starts on.
#[derive(Debug, Clone, PartialEq)]
pub struct StageInstruction {
    pub line: usize,
    pub instruction: Instruction,
}

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// FROM [--platform=p] base_image [AS name]
    From {
        image: String,
        stage_name: Option<String>,
        platform: Option<String>,
    },

    /// RUN command
    Run {
        command: RunCommand,
    },

    /// COPY [--from=stage] [--chown=u:g] [--chmod=mode] src... dest
    Copy {
        from_stage: Option<String>,
        sources: Vec<String>,
        destination: String,
        chown: Option<String>,
        chmod: Option<String>,
    },

    /// ADD [--chown=u:g] [--chmod=mode] src... dest
    Add {
        sources: Vec<String>,
        destination: String,
        chown: Option<String>,
        chmod: Option<String>,
    },

    /// ENV key=value or ENV key value
    Env {
        vars: BTreeMap<String, String>,
    },

    /// ARG name[=default]
    Arg {
        name: String,
        default: Option<String>,
    },

    /// LABEL key=value
    Label {
        labels: BTreeMap<String, String>,
    },

    /// EXPOSE port[/protocol]
    Expose {
        ports: Vec<String>,
    },

    /// WORKDIR /path
    Workdir {
        path: String,
    },

    /// USER user[:group]
    User {
        user: String,
    },

    /// VOLUME ["/data"]
    Volume {
        paths: Vec<String>,
    },

    /// ENTRYPOINT ["exec", "form"] or ENTRYPOINT command
    Entrypoint {
        command: RunCommand,
    },

    /// CMD ["exec", "form"] or CMD command
    Cmd {
        command: RunCommand,
    },

    /// HEALTHCHECK --options CMD command, or HEALTHCHECK NONE
    Healthcheck {
        config: Option<HealthcheckConfig>,
    },

    /// STOPSIGNAL signal
    Stopsignal {
        signal: String,
    },

    /// SHELL ["executable", "parameters"]
    Shell {
        shell: Vec<String>,
    },
}

impl Instruction {
    /// Upper-case keyword of this instruction.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::From { .. } => "FROM",
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Env { .. } => "ENV",
            Instruction::Arg { .. } => "ARG",
            Instruction::Label { .. } => "LABEL",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::User { .. } => "USER",
            Instruction::Volume { .. } => "VOLUME",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Healthcheck { .. } => "HEALTHCHECK",
            Instruction::Stopsignal { .. } => "STOPSIGNAL",
            Instruction::Shell { .. } => "SHELL",
        }
    }
}

/// RUN/CMD/ENTRYPOINT command format.
#[derive(Debug, Clone, PartialEq)]
pub enum RunCommand {
    /// Shell form: RUN apt-get update
    Shell(String),
    /// Exec form: RUN ["apt-get", "update"]
    Exec(Vec<String>),
}

/// Healthcheck configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthcheckConfig {
    pub command: RunCommand,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub start_period: Option<String>,
    pub retries: Option<u32>,
}

/// Dockerfile parse error.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
    pub hint: Option<String>,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self { line, message: message.into(), hint: None }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)?;
        if let Some(hint) = &self.hint {
            write!(f, "\n  Hint: {}", hint)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Parses a Dockerfile from a string.
///
/// # Examples
/// ```
/// use kiln_core::builder::parser::parse_dockerfile;
///
/// let dockerfile = r#"
/// FROM alpine:3.19
/// RUN apk add --no-cache nginx
/// CMD ["nginx", "-g", "daemon off;"]
/// "#;
///
/// let parsed = parse_dockerfile(dockerfile).unwrap();
/// assert_eq!(parsed.stages.len(), 1);
/// ```
pub fn parse_dockerfile(content: &str) -> Result<Dockerfile, ParseError> {
    let mut parser = DockerfileParser::new(content)?;
    parser.parse()
}

/// Parses a Dockerfile from a file.
pub fn parse_dockerfile_file(path: &Path) -> Result<Dockerfile, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ParseError::new(0, format!("Failed to read Dockerfile: {}", e))
            .with_hint(format!("Check that {} exists and is readable", path.display()))
    })?;

    parse_dockerfile(&content)
}

/// Internal parser state.
struct DockerfileParser {
    lines: Vec<(usize, String)>, // (line_number, content)
    pos: usize,
    global_args: BTreeMap<String, Option<String>>,
}

impl DockerfileParser {
    fn new(content: &str) -> Result<Self, ParseError> {
        let lines = Self::preprocess(content)?;
        Ok(Self { lines, pos: 0, global_args: BTreeMap::new() })
    }

    /// Joins continuation lines and drops comments and blank lines.
    ///
    /// Only full-line comments are recognized; `#` elsewhere is literal, so
    /// `RUN echo "#1"` keeps its argument.
    fn preprocess(content: &str) -> Result<Vec<(usize, String)>, ParseError> {
        let mut result = Vec::new();
        let mut current_line = String::new();
        let mut current_line_num = 0;
        let mut continuation = false;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-based line numbers
            let trimmed = line.trim();

            // Comment lines inside a continuation are skipped without ending it
            if trimmed.starts_with('#') {
                continue;
            }

            if trimmed.is_empty() {
                continue;
            }

            let ends_with_backslash = trimmed.ends_with('\\');
            let body = trimmed.trim_end_matches('\\').trim();

            if continuation {
                if !body.is_empty() {
                    current_line.push(' ');
                    current_line.push_str(body);
                }
            } else {
                current_line_num = line_num;
                current_line = body.to_string();
            }

            continuation = ends_with_backslash;

            if !continuation && !current_line.is_empty() {
                result.push((current_line_num, std::mem::take(&mut current_line)));
            }
        }

        if continuation {
            return Err(ParseError::new(current_line_num, "Unterminated line continuation")
                .with_hint("The last instruction ends with '\\' but no line follows"));
        }

        Ok(result)
    }

    fn parse(&mut self) -> Result<Dockerfile, ParseError> {
        // Parse global ARGs (before first FROM)
        while !self.is_eof() {
            let (line_num, line) = (self.lines[self.pos].0, self.lines[self.pos].1.clone());
            let instruction = Self::extract_instruction(&line);

            if instruction == "ARG" {
                self.parse_global_arg(line_num, &line)?;
                self.pos += 1;
            } else if instruction == "FROM" {
                break;
            } else {
                return Err(ParseError::new(
                    line_num,
                    format!("Expected ARG or FROM, found {}", instruction),
                )
                .with_hint("Dockerfile must start with ARG or FROM instruction"));
            }
        }

        // Parse stages
        let mut stages = Vec::new();
        while !self.is_eof() {
            stages.push(self.parse_stage()?);
        }

        if stages.is_empty() {
            return Err(ParseError::new(1, "Dockerfile must contain at least one FROM instruction"));
        }

        Ok(Dockerfile { stages, global_args: self.global_args.clone() })
    }

    fn parse_stage(&mut self) -> Result<BuildStage, ParseError> {
        let (line_num, line) = {
            let (num, l) = self.current_line()?;
            (*num, l.clone())
        };

        let from_inst = self.parse_from(line_num, &line)?;
        self.pos += 1;

        let (from, stage_name, platform) = match &from_inst {
            Instruction::From { image, stage_name, platform } => {
                (image.clone(), stage_name.clone(), platform.clone())
            }
            _ => return Err(ParseError::new(line_num, "Each build stage must start with FROM")),
        };

        let mut instructions = vec![StageInstruction { line: line_num, instruction: from_inst }];

        while !self.is_eof() {
            let (line_num, line) = (self.lines[self.pos].0, self.lines[self.pos].1.clone());

            // Next FROM starts a new stage
            if Self::extract_instruction(&line) == "FROM" {
                break;
            }

            let instruction = self.parse_instruction(line_num, &line)?;
            instructions.push(StageInstruction { line: line_num, instruction });
            self.pos += 1;
        }

        Ok(BuildStage { name: stage_name, from, platform, instructions })
    }

    fn parse_instruction(&mut self, line_num: usize, line: &str) -> Result<Instruction, ParseError> {
        let instruction = Self::extract_instruction(line);
        let args = Self::extract_args(line);

        match instruction.as_str() {
            "FROM" => self.parse_from(line_num, line),
            "RUN" => self.parse_run(line_num, &args),
            "COPY" => self.parse_copy(line_num, &args),
            "ADD" => self.parse_add(line_num, &args),
            "ENV" => self.parse_env(line_num, &args),
            "ARG" => self.parse_arg(line_num, &args),
            "LABEL" => self.parse_label(line_num, &args),
            "EXPOSE" => self.parse_expose(line_num, &args),
            "WORKDIR" => self.parse_workdir(line_num, &args),
            "USER" => self.parse_user(line_num, &args),
            "VOLUME" => self.parse_volume(line_num, &args),
            "ENTRYPOINT" => self.parse_entrypoint(line_num, &args),
            "CMD" => self.parse_cmd(line_num, &args),
            "HEALTHCHECK" => self.parse_healthcheck(line_num, &args),
            "STOPSIGNAL" => self.parse_stopsignal(line_num, &args),
            "SHELL" => self.parse_shell(line_num, &args),
            _ => Err(ParseError::new(line_num, format!("Unknown instruction: {}", instruction))),
        }
    }

    fn parse_from(&mut self, line_num: usize, line: &str) -> Result<Instruction, ParseError> {
        // FROM [--platform=<platform>] <image> [AS <name>]
        let args = Self::extract_args(line);

        let mut platform = None;
        let mut image_start = 0;

        if let Some(p) = args.first().and_then(|s| s.strip_prefix("--platform=")) {
            platform = Some(p.to_string());
            image_start = 1;
        }

        let image = args.get(image_start).cloned().ok_or_else(|| {
            ParseError::new(line_num, "FROM instruction requires an image reference")
                .with_hint("Usage: FROM <image> [AS <name>]")
        })?;

        let rest = &args[image_start + 1..];
        let stage_name = match rest {
            [] => None,
            [kw, name] if kw.eq_ignore_ascii_case("AS") => Some(name.to_lowercase()),
            [kw] if kw.eq_ignore_ascii_case("AS") => {
                return Err(ParseError::new(line_num, "FROM ... AS requires a stage name"));
            }
            _ => {
                return Err(ParseError::new(
                    line_num,
                    format!("Unexpected arguments after FROM image: {}", rest.join(" ")),
                )
                .with_hint("Usage: FROM <image> [AS <name>]"));
            }
        };

        Ok(Instruction::From { image, stage_name, platform })
    }

    fn parse_run(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "RUN instruction requires a command")
                .with_hint("Usage: RUN <command> or RUN [\"executable\", \"arg1\"]"));
        }

        Ok(Instruction::Run { command: Self::parse_run_command(args) })
    }

    fn parse_run_command(args: &[String]) -> RunCommand {
        // Check if it's JSON array format
        if args.first().map(|a| a.starts_with('[')).unwrap_or(false) {
            let json_str = args.join(" ");
            if let Ok(exec_args) = serde_json::from_str::<Vec<String>>(&json_str) {
                return RunCommand::Exec(exec_args);
            }
        }

        RunCommand::Shell(args.join(" "))
    }

    /// Splits leading `--flag=value` options off an argument list.
    fn split_flags(args: &[String]) -> (BTreeMap<String, String>, &[String]) {
        let mut flags = BTreeMap::new();
        let mut start = 0;
        for arg in args {
            match arg.strip_prefix("--").and_then(|f| f.split_once('=')) {
                Some((name, value)) => {
                    flags.insert(name.to_string(), value.to_string());
                    start += 1;
                }
                None => break,
            }
        }
        (flags, &args[start..])
    }

    fn parse_copy(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let (mut flags, rest) = Self::split_flags(args);
        let (sources, destination) = Self::sources_and_destination(line_num, "COPY", rest)?;

        Ok(Instruction::Copy {
            from_stage: flags.remove("from"),
            sources,
            destination,
            chown: flags.remove("chown"),
            chmod: flags.remove("chmod"),
        })
    }

    fn parse_add(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let (mut flags, rest) = Self::split_flags(args);
        let (sources, destination) = Self::sources_and_destination(line_num, "ADD", rest)?;

        Ok(Instruction::Add {
            sources,
            destination,
            chown: flags.remove("chown"),
            chmod: flags.remove("chmod"),
        })
    }

    fn sources_and_destination(
        line_num: usize,
        keyword: &str,
        args: &[String],
    ) -> Result<(Vec<String>, String), ParseError> {
        // JSON form: COPY ["src", "dest"]
        let args: Vec<String> = match args {
            [single] if single.starts_with('[') => serde_json::from_str::<Vec<String>>(single)
                .map_err(|_| ParseError::new(line_num, format!("Invalid JSON array for {}", keyword)))?,
            _ => args.to_vec(),
        };

        match args.split_last() {
            Some((destination, sources)) if !sources.is_empty() => {
                Ok((sources.to_vec(), destination.clone()))
            }
            _ => Err(ParseError::new(
                line_num,
                format!("{} requires at least source and destination", keyword),
            )
            .with_hint(format!("Usage: {} <src>... <dest>", keyword))),
        }
    }

    fn parse_env(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // ENV key=value or ENV key value
        if args.is_empty() {
            return Err(ParseError::new(line_num, "ENV requires at least one key=value pair"));
        }

        let mut vars = BTreeMap::new();

        if args[0].contains('=') {
            for arg in args {
                match arg.split_once('=') {
                    Some((key, value)) if !key.is_empty() => {
                        vars.insert(key.to_string(), unquote(value));
                    }
                    _ => {
                        return Err(ParseError::new(
                            line_num,
                            format!("ENV expects key=value, found {}", arg),
                        ))
                    }
                }
            }
        } else {
            // key value format (only supports one pair)
            if args.len() < 2 {
                return Err(ParseError::new(line_num, "ENV requires a value"));
            }
            vars.insert(args[0].clone(), unquote(&args[1..].join(" ")));
        }

        Ok(Instruction::Env { vars })
    }

    fn parse_arg(&mut self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let first = args.first().ok_or_else(|| {
            ParseError::new(line_num, "ARG requires a name").with_hint("Usage: ARG <name>[=<default>]")
        })?;

        let (name, default) = match first.split_once('=') {
            Some((name, default)) => (name.to_string(), Some(unquote(default))),
            None => (first.clone(), None),
        };

        if name.is_empty() {
            return Err(ParseError::new(line_num, "ARG requires a name"));
        }

        Ok(Instruction::Arg { name, default })
    }

    fn parse_global_arg(&mut self, line_num: usize, line: &str) -> Result<(), ParseError> {
        let args = Self::extract_args(line);
        if let Instruction::Arg { name, default } = self.parse_arg(line_num, &args)? {
            self.global_args.insert(name, default);
        }
        Ok(())
    }

    fn parse_label(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        let mut labels = BTreeMap::new();

        for arg in args {
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                ParseError::new(line_num, format!("LABEL expects key=value, found {}", arg))
            })?;
            labels.insert(unquote(key), unquote(value));
        }

        if labels.is_empty() {
            return Err(ParseError::new(line_num, "LABEL requires at least one key=value pair"));
        }

        Ok(Instruction::Label { labels })
    }

    fn parse_expose(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "EXPOSE requires at least one port"));
        }
        Ok(Instruction::Expose { ports: args.to_vec() })
    }

    fn parse_workdir(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "WORKDIR requires a path"));
        }
        Ok(Instruction::Workdir { path: unquote(&args.join(" ")) })
    }

    fn parse_user(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "USER requires a user name or UID"));
        }
        Ok(Instruction::User { user: args.join(" ") })
    }

    fn parse_volume(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // VOLUME ["/data"] or VOLUME /data /var/log
        let paths = if args.len() == 1 && args[0].starts_with('[') {
            serde_json::from_str::<Vec<String>>(&args[0])
                .map_err(|_| ParseError::new(line_num, "Invalid JSON array for VOLUME"))?
        } else {
            args.to_vec()
        };

        if paths.is_empty() {
            return Err(ParseError::new(line_num, "VOLUME requires at least one path"));
        }

        Ok(Instruction::Volume { paths })
    }

    fn parse_entrypoint(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "ENTRYPOINT requires a command"));
        }
        Ok(Instruction::Entrypoint { command: Self::parse_run_command(args) })
    }

    fn parse_cmd(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "CMD requires a command"));
        }
        Ok(Instruction::Cmd { command: Self::parse_run_command(args) })
    }

    fn parse_healthcheck(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // HEALTHCHECK NONE | HEALTHCHECK [OPTIONS] CMD command
        if args.len() == 1 && args[0].eq_ignore_ascii_case("NONE") {
            return Ok(Instruction::Healthcheck { config: None });
        }

        let (mut flags, rest) = Self::split_flags(args);
        let cmd_args = match rest.split_first() {
            Some((kw, cmd)) if kw.eq_ignore_ascii_case("CMD") && !cmd.is_empty() => cmd,
            _ => {
                return Err(ParseError::new(line_num, "HEALTHCHECK requires CMD <command> or NONE")
                    .with_hint("Usage: HEALTHCHECK [--interval=30s] CMD <command>"))
            }
        };

        let retries = match flags.remove("retries") {
            Some(r) => Some(r.parse().map_err(|_| {
                ParseError::new(line_num, format!("Invalid retries value: {}", r))
            })?),
            None => None,
        };

        Ok(Instruction::Healthcheck {
            config: Some(HealthcheckConfig {
                command: Self::parse_run_command(cmd_args),
                interval: flags.remove("interval"),
                timeout: flags.remove("timeout"),
                start_period: flags.remove("start-period"),
                retries,
            }),
        })
    }

    fn parse_stopsignal(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        if args.is_empty() {
            return Err(ParseError::new(line_num, "STOPSIGNAL requires a signal"));
        }
        Ok(Instruction::Stopsignal { signal: args.join(" ") })
    }

    fn parse_shell(&self, line_num: usize, args: &[String]) -> Result<Instruction, ParseError> {
        // SHELL ["executable", "parameters"]
        let json_str = args.join(" ");
        let shell = serde_json::from_str::<Vec<String>>(&json_str)
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                ParseError::new(line_num, "SHELL requires JSON array format")
                    .with_hint("Usage: SHELL [\"executable\", \"arg1\", \"arg2\"]")
            })?;

        Ok(Instruction::Shell { shell })
    }

    fn extract_instruction(line: &str) -> String {
        line.split_whitespace().next().unwrap_or("").to_uppercase()
    }

    fn extract_args(line: &str) -> Vec<String> {
        let mut parts = line.splitn(2, char::is_whitespace);
        parts.next(); // Skip instruction

        match parts.next() {
            Some(args_str) => Self::tokenize(args_str.trim()),
            None => Vec::new(),
        }
    }

    /// Simple tokenizer that respects quotes and JSON arrays.
    fn tokenize(s: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_json = 0;

        for c in s.chars() {
            match c {
                '"' if in_json == 0 => {
                    in_quotes = !in_quotes;
                    current.push(c);
                }
                '[' if !in_quotes && current.is_empty() || in_json > 0 && c == '[' => {
                    in_json += 1;
                    current.push(c);
                }
                ']' if !in_quotes && in_json > 0 => {
                    in_json -= 1;
                    current.push(c);
                    if in_json == 0 {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                ' ' | '\t' if !in_quotes && in_json == 0 => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            }
        }

        if !current.is_empty() {
            tokens.push(current);
        }

        tokens
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.lines.len()
    }

    fn current_line(&self) -> Result<&(usize, String), ParseError> {
        self.lines.get(self.pos).ok_or_else(|| {
            ParseError::new(self.lines.last().map(|(n, _)| *n).unwrap_or(0), "Unexpected end of file")
        })
    }
}

/// Strips one pair of surrounding double or single quotes.
fn unquote(s: &str) -> String {
    let s = s.trim();
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(parsed: &Dockerfile, stage: usize, idx: usize) -> &Instruction {
        &parsed.stages[stage].instructions[idx].instruction
    }

    #[test]
    fn test_simple_dockerfile() {
        let dockerfile = r#"
FROM alpine:3.19
RUN apk add --no-cache nginx
CMD ["nginx", "-g", "daemon off;"]
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(parsed.stages.len(), 1);

        let stage = &parsed.stages[0];
        assert_eq!(stage.name, None);
        assert_eq!(stage.from, "alpine:3.19");

        // Should have FROM + RUN + CMD = 3 instructions
        assert_eq!(stage.instructions.len(), 3);
        assert_eq!(stage.instructions[1].line, 3);

        match instr(&parsed, 0, 2) {
            Instruction::Cmd { command: RunCommand::Exec(args) } => {
                assert_eq!(args, &vec!["nginx", "-g", "daemon off;"]);
            }
            other => panic!("Expected exec-form CMD, got {:?}", other),
        }
    }

    #[test]
    fn test_multi_stage_build() {
        let dockerfile = r#"
FROM golang:1.21 AS builder
WORKDIR /app
COPY . .
RUN go build -o myapp

FROM --platform=linux/amd64 alpine:3.19
COPY --from=builder /app/myapp /usr/local/bin/
CMD ["myapp"]
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(parsed.stages.len(), 2);

        assert_eq!(parsed.stages[0].name, Some("builder".into()));
        assert_eq!(parsed.stages[1].name, None);
        assert_eq!(parsed.stages[1].platform.as_deref(), Some("linux/amd64"));

        match instr(&parsed, 1, 1) {
            Instruction::Copy { from_stage, sources, destination, .. } => {
                assert_eq!(from_stage.as_deref(), Some("builder"));
                assert_eq!(sources, &vec!["/app/myapp".to_string()]);
                assert_eq!(destination, "/usr/local/bin/");
            }
            other => panic!("Expected COPY, got {:?}", other),
        }
    }

    #[test]
    fn test_global_arg_parsing() {
        let dockerfile = r#"
ARG VERSION=1.0
ARG FLAVOR
FROM alpine:${VERSION}
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(parsed.global_args.len(), 2);
        assert_eq!(parsed.global_args.get("VERSION"), Some(&Some("1.0".into())));
        assert_eq!(parsed.global_args.get("FLAVOR"), Some(&None));
        // Expansion is the frontend's job
        assert_eq!(parsed.stages[0].from, "alpine:${VERSION}");
    }

    #[test]
    fn test_line_continuation() {
        let dockerfile = r#"
FROM alpine:3.19
RUN apk add --no-cache \
    nginx \
    # comments inside continuations are dropped
    curl \
    bash
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(parsed.stages[0].instructions.len(), 2);
        assert_eq!(
            instr(&parsed, 0, 1),
            &Instruction::Run { command: RunCommand::Shell("apk add --no-cache nginx curl bash".into()) }
        );
    }

    #[test]
    fn test_unterminated_continuation() {
        let dockerfile = "FROM alpine\nRUN echo hello \\";
        let err = parse_dockerfile(dockerfile).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.message.contains("Unterminated"));
    }

    #[test]
    fn test_comments() {
        let dockerfile = r##"
# This is a comment
FROM alpine:3.19
# Another comment
RUN echo "#not-a-comment"
        "##;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        assert_eq!(parsed.stages.len(), 1);
        assert_eq!(
            instr(&parsed, 0, 1),
            &Instruction::Run { command: RunCommand::Shell("echo \"#not-a-comment\"".into()) }
        );
    }

    #[test]
    fn test_env_parsing() {
        let dockerfile = r#"
FROM alpine
ENV KEY1=value1 KEY2="quoted value"
ENV KEY3 value with spaces
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();

        if let Instruction::Env { vars } = instr(&parsed, 0, 1) {
            assert_eq!(vars.len(), 2);
            assert_eq!(vars.get("KEY1"), Some(&"value1".to_string()));
            assert_eq!(vars.get("KEY2"), Some(&"quoted value".to_string()));
        } else {
            panic!("Expected ENV instruction");
        }

        if let Instruction::Env { vars } = instr(&parsed, 0, 2) {
            assert_eq!(vars.get("KEY3"), Some(&"value with spaces".to_string()));
        } else {
            panic!("Expected ENV instruction");
        }
    }

    #[test]
    fn test_healthcheck_forms() {
        let dockerfile = r#"
FROM alpine
HEALTHCHECK --interval=5s --retries=3 CMD curl -f http://localhost/
HEALTHCHECK NONE
        "#;

        let parsed = parse_dockerfile(dockerfile).unwrap();
        match instr(&parsed, 0, 1) {
            Instruction::Healthcheck { config: Some(config) } => {
                assert_eq!(config.interval.as_deref(), Some("5s"));
                assert_eq!(config.retries, Some(3));
                assert_eq!(config.command, RunCommand::Shell("curl -f http://localhost/".into()));
            }
            other => panic!("Expected HEALTHCHECK, got {:?}", other),
        }
        assert_eq!(instr(&parsed, 0, 2), &Instruction::Healthcheck { config: None });
    }

    #[test]
    fn test_copy_flags() {
        let parsed =
            parse_dockerfile("FROM alpine\nCOPY --chown=app:app --chmod=755 a b /dst/").unwrap();
        match instr(&parsed, 0, 1) {
            Instruction::Copy { sources, chown, chmod, from_stage, .. } => {
                assert_eq!(sources.len(), 2);
                assert_eq!(chown.as_deref(), Some("app:app"));
                assert_eq!(chmod.as_deref(), Some("755"));
                assert!(from_stage.is_none());
            }
            other => panic!("Expected COPY, got {:?}", other),
        }
    }

    #[test]
    fn test_error_from_without_image() {
        let err = parse_dockerfile("FROM\nRUN echo").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("image reference"));
    }

    #[test]
    fn test_error_no_from() {
        let result = parse_dockerfile("RUN echo hello");
        assert!(result.is_err());
    }

    #[test]
    fn test_error_unknown_instruction() {
        let dockerfile = r#"
FROM alpine
INVALID instruction
        "#;
        let err = parse_dockerfile(dockerfile).unwrap_err();
        assert_eq!(err.line, 3);
        assert!(err.message.contains("Unknown instruction"));
    }
}
