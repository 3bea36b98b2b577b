//! MagikPack - Cloud Native Buildpacks CLI
//!
//! Builds an OCI image from application source by driving the CNB lifecycle
//! against a Docker-compatible engine.
//!
//! ## Usage
//!
//! ```sh
//! magikpack build --builder <ref> --output <ref> --path <dir> [options]
//! magikpack version
//! magikpack help
//! ```
//!
//! Logging follows `RUST_LOG` (default `info`).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use magikpack::{BuildConfig, BuildRequest, DirectoryContent, DockerCliRuntime, Orchestrator};
use tracing::error;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug, Default)]
struct BuildArgs {
    builder: Option<String>,
    output: Option<String>,
    paths: Vec<PathBuf>,
    run_image: Option<String>,
    lifecycle_image: Option<String>,
    platform_level: Option<String>,
    trust_builder: Option<bool>,
    env: BTreeMap<String, String>,
    tags: Vec<String>,
    extensions: Vec<String>,
    buildpacks: Vec<String>,
    config: Option<PathBuf>,
}

#[derive(Debug)]
enum Command {
    Build(Box<BuildArgs>),
    Version,
    Help,
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "build" => parse_build(&args[2..]).map(|b| Command::Build(Box::new(b))),
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

fn parse_build(args: &[String]) -> Result<BuildArgs, String> {
    let mut build = BuildArgs::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let value = || {
            args.get(i + 1)
                .cloned()
                .ok_or_else(|| format!("{} requires a value", flag))
        };
        match flag {
            "--builder" | "-B" => build.builder = Some(value()?),
            "--output" | "-o" => build.output = Some(value()?),
            "--path" | "-p" => build.paths.push(PathBuf::from(value()?)),
            "--run-image" => build.run_image = Some(value()?),
            "--lifecycle-image" => build.lifecycle_image = Some(value()?),
            "--platform-level" => build.platform_level = Some(value()?),
            "--tag" | "-t" => build.tags.push(value()?),
            "--extension" => build.extensions.push(value()?),
            "--buildpack" | "-b" => build.buildpacks.push(value()?),
            "--config" | "-c" => build.config = Some(PathBuf::from(value()?)),
            "--env" | "-e" => {
                let pair = value()?;
                let (key, val) = pair
                    .split_once('=')
                    .ok_or_else(|| format!("--env expects KEY=VALUE, got '{}'", pair))?;
                build.env.insert(key.to_string(), val.to_string());
            }
            "--trust-builder" => {
                build.trust_builder = Some(true);
                i += 1;
                continue;
            }
            "--no-trust-builder" => {
                build.trust_builder = Some(false);
                i += 1;
                continue;
            }
            unknown => return Err(format!("unknown build option: {}", unknown)),
        }
        i += 2;
    }

    if build.paths.is_empty() {
        build.paths.push(PathBuf::from("."));
    }
    Ok(build)
}

// =============================================================================
// Command Implementations
// =============================================================================

fn build_request(args: BuildArgs) -> Result<BuildRequest, String> {
    let mut config = match &args.config {
        Some(path) => BuildConfig::load(path).map_err(|e| e.to_string())?,
        None => BuildConfig::default(),
    };

    let platform = &mut config.platform;
    if args.platform_level.is_some() {
        platform.level = args.platform_level;
    }
    if args.trust_builder.is_some() {
        platform.trust_builder = args.trust_builder;
    }
    if args.lifecycle_image.is_some() {
        platform.lifecycle_image = args.lifecycle_image;
    }
    platform.extensions.extend(args.extensions);
    platform.buildpacks.extend(args.buildpacks);
    platform.environment.extend(args.env);

    let builder = args.builder.ok_or("--builder is required")?;
    let output = args.output.ok_or("--output is required")?;

    let mut request = BuildRequest::new(builder, output).with_config(config);
    for path in args.paths {
        request = request.with_content(DirectoryContent::new(path));
    }
    for tag in args.tags {
        request = request.with_tag(tag);
    }
    if let Some(run_image) = args.run_image {
        request = request.with_run_image(run_image);
    }
    Ok(request)
}

fn cmd_build(args: BuildArgs) -> Result<i64, String> {
    let request = build_request(args)?;
    let runtime = Arc::new(DockerCliRuntime::from_config(&request.config.docker));
    let orchestrator = Orchestrator::new(runtime);

    let rt = tokio::runtime::Runtime::new().map_err(|e| format!("tokio runtime: {}", e))?;
    rt.block_on(async {
        let shutdown = async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        };
        orchestrator.build_until(&request, shutdown).await
    })
    .map_err(|e| e.to_string())
}

fn cmd_version() {
    println!("magikpack {}", env!("CARGO_PKG_VERSION"));
    let levels: Vec<String> = magikpack::SUPPORTED_PLATFORM_LEVELS
        .iter()
        .map(ToString::to_string)
        .collect();
    println!("platform api: {}", levels.join(", "));
}

fn cmd_help() {
    println!(
        r#"magikpack - Cloud Native Buildpacks platform

USAGE:
    magikpack <command> [options]

COMMANDS:
    build       Build an image from application source
    version     Print version information
    help        Print this help

BUILD OPTIONS:
    -B, --builder <ref>          Builder image (required)
    -o, --output <ref>           Output image (required)
    -p, --path <dir>             Application directory (repeatable, default .)
    -t, --tag <ref>              Additional output tag (repeatable)
        --run-image <ref>        Run image override
        --lifecycle-image <ref>  Lifecycle image replacing the builder's
        --platform-level <x.y>   Pin the platform API level
        --trust-builder          Run the single creator phase
        --no-trust-builder       Always run the full phase sequence
    -e, --env <KEY=VALUE>        Platform environment (repeatable)
        --extension <ref>        Extension image to merge (repeatable)
    -b, --buildpack <ref>        Buildpack image to merge (repeatable)
    -c, --config <file>          TOML configuration file

ENVIRONMENT:
    RUST_LOG                     Log filter (default: info)
    MAGIKPACK_LIFECYCLE_DEBUG    Wrap every phase in a debug script"#
    );
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    init_logging();
    let args: Vec<String> = std::env::args().collect();

    match parse_args(&args) {
        Ok(Command::Build(build)) => match cmd_build(*build) {
            Ok(0) => ExitCode::SUCCESS,
            Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        },
        Ok(Command::Version) => {
            cmd_version();
            ExitCode::SUCCESS
        }
        Ok(Command::Help) => {
            cmd_help();
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
