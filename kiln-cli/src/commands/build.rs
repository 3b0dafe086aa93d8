//! `kiln build` command

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use kiln_core::builder::LocalExecutor;
use kiln_core::observability::ProgressTracker;
use kiln_core::{
    BuildConfig, Builder, BuilderOptions, EventType, OutputFormat, Platform, Settings,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub context: PathBuf,

    /// Dockerfile path, relative to the context
    #[arg(short = 'f', long = "file", default_value = "Dockerfile")]
    pub file: PathBuf,

    /// Image tags (name:tag), may be repeated
    #[arg(short = 't', long = "tag")]
    pub tags: Vec<String>,

    /// Target platforms, comma separated (e.g. linux/amd64,linux/arm64)
    #[arg(long)]
    pub platform: Option<String>,

    /// Push the result to its registry
    #[arg(long)]
    pub push: bool,

    /// Registry reference used as a remote cache
    #[arg(long)]
    pub registry_cache: Option<String>,

    /// Build-time variables (KEY=VALUE), may be repeated
    #[arg(long = "build-arg", value_parser = parse_build_arg)]
    pub build_args: Vec<(String, String)>,

    /// Stage to stop at
    #[arg(long)]
    pub target: Option<String>,

    /// Ignore cached results
    #[arg(long)]
    pub no_cache: bool,

    /// Output format (image, tar, local, oci, multiarch)
    #[arg(long, default_value = "image")]
    pub output: String,

    /// Where to write the exported artifact
    #[arg(long)]
    pub output_path: Option<PathBuf>,

    /// Dispatch operations as soon as their inputs finish
    #[arg(long)]
    pub pipelined: bool,

    /// Build platforms one after another
    #[arg(long)]
    pub sequential_platforms: bool,

    /// Run RUN instructions through the host shell
    #[arg(long)]
    pub host_exec: bool,

    /// Overall build timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Print the build report as JSON
    #[arg(long)]
    pub report_json: bool,
}

impl BuildArgs {
    fn into_config(self) -> Result<BuildConfig> {
        let output = OutputFormat::parse(&self.output)
            .with_context(|| format!("unknown output format: {}", self.output))?;
        let platforms = match &self.platform {
            Some(list) => Platform::parse_list(list)
                .map_err(|e| anyhow::anyhow!("invalid --platform: {}", e))?,
            None => Vec::new(),
        };
        for tag in &self.tags {
            parse_tag(tag)?;
        }

        let mut config = BuildConfig {
            context_path: self.context,
            dockerfile_path: self.file,
            tags: self.tags,
            output,
            output_path: self.output_path,
            platforms,
            build_args: self.build_args.into_iter().collect::<BTreeMap<_, _>>(),
            target: self.target,
            push: self.push,
            no_cache: self.no_cache,
            pipelined: self.pipelined,
            parallel_platforms: !self.sequential_platforms,
            timeout: self.timeout.map(Duration::from_secs),
            ..BuildConfig::default()
        };
        config.registry.cache_ref = self.registry_cache;
        Ok(config)
    }
}

/// Runs a build and returns the process exit code.
pub async fn build(args: BuildArgs) -> Result<i32> {
    let host_exec = args.host_exec;
    let report_json = args.report_json;
    let config = args.into_config()?;

    if !config.context_path.is_dir() {
        bail!("build context not found: {}", config.context_path.display());
    }

    let settings = Settings::load().context("failed to load settings")?;
    let mut builder =
        Builder::new(BuilderOptions::from_settings(&settings)).context("failed to create builder")?;
    if host_exec {
        builder = builder
            .with_executor(Arc::new(LocalExecutor::new(&config.context_path).with_host_exec(true)));
    }

    let platforms: Vec<String> =
        config.effective_platforms().iter().map(ToString::to_string).collect();
    debug!(platforms = ?platforms, tags = ?config.tags, host_exec, "Starting build");
    println!("{} Building {}", "[1/3]".bold().blue(), config.resolved_dockerfile().display());
    println!("      Platforms: {}", platforms.join(", ").cyan());

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{} cancelling build...", "Interrupted:".yellow());
            interrupt.cancel();
        }
    });

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("=>-"),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let subscriber = builder.events().subscribe(vec![]);
    let bar = pb.clone();
    let follower = tokio::spawn(ProgressTracker::follow(subscriber, move |tracker, event| {
        let total: usize = tracker.platforms().values().map(|p| p.total).sum();
        let done: usize = tracker.platforms().values().map(|p| p.done().min(p.total)).sum();
        bar.set_length(total as u64);
        bar.set_position(done as u64);
        if event.is(EventType::OperationStarted) {
            bar.set_message(event.message.clone());
        } else if event.is(EventType::OperationFailed) {
            bar.println(format!("  {} {}", "✗".red(), event.message));
        }
    }));

    let outcome = builder.build(&config, &cancel).await;
    builder.shutdown().await;
    follower.abort();
    pb.finish_and_clear();

    let result = &outcome.result;
    println!("{} Results", "[2/3]".bold().blue());
    for (platform, platform_result) in &result.platform_results {
        let status = if platform_result.success { "✓".green() } else { "✗".red() };
        let detail = match (&platform_result.image_id, &platform_result.error) {
            (Some(id), _) => short_id(id).to_string(),
            (None, Some(err)) => err.red().to_string(),
            (None, None) => String::new(),
        };
        println!(
            "      {} {:<16} {} ops, {} cached, {}  {}",
            status,
            platform,
            platform_result.operations,
            platform_result.cache_hits,
            format_duration(platform_result.duration),
            detail
        );
    }
    if let Some(list) = &result.manifest_list_id {
        println!("      Manifest list: {}", short_id(list).cyan());
    }

    println!("{} Summary", "[3/3]".bold().blue());
    if result.success {
        println!(
            "{} Built in {} ({} operations, {} cache hits, {:.0}% hit rate)",
            "✓".green().bold(),
            format_duration(result.duration),
            result.operations,
            result.cache_hits,
            outcome.report.cache_hit_rate * 100.0
        );
        if let Some(artifact) = &outcome.artifact {
            println!("  Output: {}", artifact.display());
        }
        for tag in &config.tags {
            println!("  Tagged: {}", tag.cyan());
        }
    } else {
        let kind = result.error_kind.map(|k| k.as_str()).unwrap_or("unknown");
        eprintln!(
            "{} Build failed [{}]: {}",
            "✗".red().bold(),
            kind,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }

    if report_json {
        println!("{}", outcome.report.to_json_pretty());
    }

    Ok(result.exit_code())
}

/// Validates a `name[:tag]` reference and returns its parts.
pub fn parse_tag(tag: &str) -> Result<(String, String)> {
    // A colon after the last slash separates the tag; one before it is a registry port
    let last_slash = tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, version) = match tag[last_slash..].rfind(':') {
        Some(i) => (&tag[..last_slash + i], &tag[last_slash + i + 1..]),
        None => (tag, "latest"),
    };
    if name.is_empty() || version.is_empty() {
        bail!("invalid tag: {}", tag);
    }
    Ok((name.to_string(), version.to_string()))
}

/// Parses a `KEY=VALUE` build argument.
pub fn parse_build_arg(s: &str) -> Result<(String, String), String> {
    let (key, value) = s.split_once('=').ok_or_else(|| format!("expected KEY=VALUE, got {}", s))?;
    if key.is_empty() {
        return Err(format!("empty build-arg name in {}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

fn short_id(id: &str) -> &str {
    let hex = id.strip_prefix("sha256:").unwrap_or(id);
    &hex[..hex.len().min(12)]
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 1 {
        format!("{}ms", d.as_millis())
    } else if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}
