//! # Phase Argument Table
//!
//! Every lifecycle flag is one [`Rule`]: the phases it applies to, the
//! platform levels it is valid for (`since` inclusive, `until` exclusive), a
//! runtime condition, and the function emitting it. Arguments come out in
//! table order, so the output image positional sits in the last rule.
//!
//! Supporting a new platform level means adding or bounding rules here.

use crate::constants::{
    ANALYZED_PATH, APP_DIR, CACHE_DIR, GENERATED_DIR, GROUP_PATH, LAUNCH_CACHE_DIR, LAYERS_DIR,
    PLAN_PATH, PLATFORM_ANALYZE_FIRST, PLATFORM_DIR, PLATFORM_EXTENSIONS, PLATFORM_LAUNCH_CACHE,
    PLATFORM_RUN_TOML, RUN_TOML_PATH, STACK_TOML_PATH,
};
use crate::reference::ImageReference;
use crate::version::Version;

use super::phase::Phase;
use super::phase::Phase::{Analyze, Build, Create, Detect, Export, ExtendBuild, ExtendRun, Restore};

/// Facts the argument table reads.
#[derive(Debug, Clone)]
pub struct ArgContext<'a> {
    pub level: Version,
    /// The composed builder carries extensions.
    pub has_extensions: bool,
    pub use_daemon: bool,
    pub clean_cache: bool,
    pub uid: u32,
    pub gid: u32,
    pub output: &'a ImageReference,
    pub tags: &'a [ImageReference],
    /// Primary run image currently in effect.
    pub run_image: Option<&'a ImageReference>,
    /// The caller chose the run image.
    pub run_image_override: bool,
    /// The run image was extended by an extender phase.
    pub run_extended: bool,
    pub builder_image: &'a ImageReference,
    pub log_level: Option<&'a str>,
}

impl ArgContext<'_> {
    /// Extensions are in play for this build.
    pub fn extensions_active(&self) -> bool {
        self.has_extensions && self.level.at_least(PLATFORM_EXTENSIONS)
    }
}

type Condition = fn(&ArgContext<'_>) -> bool;
type Emit = fn(Phase, &ArgContext<'_>, &mut Vec<String>);

struct Rule {
    phases: &'static [Phase],
    since: Option<Version>,
    until: Option<Version>,
    when: Condition,
    emit: Emit,
}

impl Rule {
    fn on(phases: &'static [Phase], emit: Emit) -> Self {
        Self {
            phases,
            since: None,
            until: None,
            when: |_| true,
            emit,
        }
    }

    fn since(mut self, level: Version) -> Self {
        self.since = Some(level);
        self
    }

    fn until(mut self, level: Version) -> Self {
        self.until = Some(level);
        self
    }

    fn when(mut self, condition: Condition) -> Self {
        self.when = condition;
        self
    }

    fn applies(&self, phase: Phase, ctx: &ArgContext<'_>) -> bool {
        self.phases.contains(&phase)
            && self.since.map_or(true, |since| ctx.level.at_least(since))
            && self.until.map_or(true, |until| ctx.level.less_than(until))
            && (self.when)(ctx)
    }
}

const ALL: &[Phase] = &[Detect, Analyze, Restore, ExtendBuild, ExtendRun, Build, Export, Create];
const EXTENDERS: &[Phase] = &[ExtendBuild, ExtendRun];

fn flag(args: &mut Vec<String>, name: &str, value: impl Into<String>) {
    args.push(name.to_string());
    args.push(value.into());
}

fn run_image_arg(ctx: &ArgContext<'_>, args: &mut Vec<String>) {
    if let Some(run_image) = ctx.run_image {
        flag(args, "-run-image", run_image.canonical());
    }
}

fn tag_args(ctx: &ArgContext<'_>, args: &mut Vec<String>) {
    for tag in ctx.tags {
        flag(args, "-tag", tag.canonical());
    }
}

fn rules() -> Vec<Rule> {
    vec![
        Rule::on(ALL, |_, ctx, args| {
            if let Some(level) = ctx.log_level {
                flag(args, "-log-level", level);
            }
        }),
        Rule::on(&[Detect, Build, ExtendBuild, ExtendRun, Create], |_, _, args| {
            flag(args, "-app", APP_DIR)
        }),
        Rule::on(ALL, |_, _, args| flag(args, "-layers", LAYERS_DIR)),
        Rule::on(&[Detect, Build, ExtendBuild, ExtendRun, Create], |_, _, args| {
            flag(args, "-platform", PLATFORM_DIR)
        }),
        // Cache and identity.
        Rule::on(&[Restore, Export, Create], |_, _, args| flag(args, "-cache-dir", CACHE_DIR)),
        Rule::on(&[Analyze], |_, _, args| flag(args, "-cache-dir", CACHE_DIR))
            .until(PLATFORM_ANALYZE_FIRST),
        Rule::on(&[Analyze, Restore, ExtendBuild, ExtendRun, Export, Create], |_, ctx, args| {
            flag(args, "-uid", ctx.uid.to_string());
            flag(args, "-gid", ctx.gid.to_string());
        }),
        // Lifecycle documents.
        Rule::on(&[Analyze, Export], |_, _, args| flag(args, "-group", GROUP_PATH))
            .until(PLATFORM_ANALYZE_FIRST),
        Rule::on(&[Restore, Build], |_, _, args| flag(args, "-group", GROUP_PATH)),
        Rule::on(&[Build], |_, _, args| flag(args, "-plan", PLAN_PATH)),
        Rule::on(&[Restore, Export], |_, _, args| flag(args, "-analyzed", ANALYZED_PATH))
            .since(PLATFORM_ANALYZE_FIRST),
        Rule::on(&[Detect], |_, _, args| flag(args, "-analyzed", ANALYZED_PATH))
            .since(PLATFORM_EXTENSIONS)
            .when(|ctx| ctx.has_extensions),
        Rule::on(&[Detect, ExtendBuild, ExtendRun], |_, _, args| {
            flag(args, "-generated", GENERATED_DIR)
        })
        .since(PLATFORM_EXTENSIONS)
        .when(|ctx| ctx.has_extensions),
        Rule::on(EXTENDERS, |phase, _, args| {
            let kind = if phase == ExtendRun { "run" } else { "build" };
            flag(args, "-kind", kind);
        })
        .since(PLATFORM_RUN_TOML),
        // Cache bypass.
        Rule::on(&[Analyze], |_, _, args| args.push("-skip-layers".to_string()))
            .until(PLATFORM_ANALYZE_FIRST)
            .when(|ctx| ctx.clean_cache),
        Rule::on(&[Restore], |_, _, args| args.push("-skip-layers".to_string()))
            .when(|ctx| ctx.clean_cache),
        Rule::on(&[Create], |_, _, args| args.push("-skip-restore".to_string()))
            .when(|ctx| ctx.clean_cache),
        // Previous image and run image.
        Rule::on(&[Analyze, Create], |_, ctx, args| {
            flag(args, "-previous-image", ctx.output.canonical())
        })
        .since(PLATFORM_ANALYZE_FIRST),
        Rule::on(&[Analyze], |_, ctx, args| {
            run_image_arg(ctx, args);
            flag(args, "-stack", STACK_TOML_PATH);
        })
        .since(PLATFORM_ANALYZE_FIRST)
        .until(PLATFORM_RUN_TOML),
        Rule::on(&[Analyze, Create], |_, ctx, args| {
            if ctx.run_image_override {
                run_image_arg(ctx, args);
            } else {
                flag(args, "-run", RUN_TOML_PATH);
            }
        })
        .since(PLATFORM_RUN_TOML),
        Rule::on(&[Create], |_, ctx, args| run_image_arg(ctx, args)).until(PLATFORM_RUN_TOML),
        Rule::on(&[Detect], |_, _, args| flag(args, "-run", RUN_TOML_PATH)).since(PLATFORM_RUN_TOML),
        Rule::on(&[Export], |_, ctx, args| run_image_arg(ctx, args)).until(PLATFORM_ANALYZE_FIRST),
        Rule::on(&[Export], |_, ctx, args| {
            if ctx.run_extended || ctx.run_image_override {
                run_image_arg(ctx, args);
            } else {
                flag(args, "-run", RUN_TOML_PATH);
            }
        })
        .since(PLATFORM_RUN_TOML),
        Rule::on(&[Restore], |_, ctx, args| {
            flag(args, "-build-image", ctx.builder_image.canonical())
        })
        .since(PLATFORM_EXTENSIONS)
        .when(|ctx| ctx.has_extensions),
        Rule::on(&[Analyze, Export, Create], |_, ctx, args| tag_args(ctx, args))
            .since(PLATFORM_ANALYZE_FIRST),
        // Daemon access.
        Rule::on(&[Analyze, Export, Create], |_, _, args| {
            flag(args, "-launch-cache", LAUNCH_CACHE_DIR)
        })
        .since(PLATFORM_LAUNCH_CACHE)
        .when(|ctx| ctx.use_daemon),
        Rule::on(ALL, |phase, ctx, args| {
            if daemon_access(phase, ctx) {
                args.push("-daemon".to_string());
            }
        }),
        // Output image last; before 0.7 additional tags follow it.
        Rule::on(&[Analyze, Export, Create], |phase, ctx, args| {
            args.push(ctx.output.canonical());
            if phase != Analyze && ctx.level.less_than(PLATFORM_ANALYZE_FIRST) {
                args.extend(ctx.tags.iter().map(ImageReference::canonical));
            }
        }),
    ]
}

/// Arguments for `phase`'s lifecycle binary, in order.
pub fn phase_args(phase: Phase, ctx: &ArgContext<'_>) -> Vec<String> {
    let mut args = Vec::new();
    for rule in rules() {
        if rule.applies(phase, ctx) {
            (rule.emit)(phase, ctx, &mut args);
        }
    }
    args
}

/// Whether `phase` talks to the engine daemon (and needs its socket).
pub fn daemon_access(phase: Phase, ctx: &ArgContext<'_>) -> bool {
    if !ctx.use_daemon {
        return false;
    }
    match phase {
        Analyze | Export | Create => true,
        Restore => ctx.extensions_active() && ctx.level.at_least(PLATFORM_RUN_TOML),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        output: ImageReference,
        tags: Vec<ImageReference>,
        run_image: ImageReference,
        builder: ImageReference,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                output: ImageReference::parse("my-app").unwrap(),
                tags: vec![ImageReference::parse("my-app:v1").unwrap()],
                run_image: ImageReference::parse("example.com/run:base").unwrap(),
                builder: ImageReference::parse("magikpack-ephemeral-builder:abc").unwrap(),
            }
        }

        fn ctx(&self, level: &str) -> ArgContext<'_> {
            ArgContext {
                level: Version::parse(level).unwrap(),
                has_extensions: false,
                use_daemon: true,
                clean_cache: false,
                uid: 1001,
                gid: 1002,
                output: &self.output,
                tags: &self.tags,
                run_image: Some(&self.run_image),
                run_image_override: false,
                run_extended: false,
                builder_image: &self.builder,
                log_level: None,
            }
        }
    }

    fn has(args: &[String], flag: &str) -> bool {
        args.iter().any(|a| a == flag)
    }

    fn value_of<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn test_detect_never_gets_daemon() {
        let f = Fixture::new();
        for level in ["0.4", "0.6", "0.9", "0.12"] {
            let args = phase_args(Phase::Detect, &f.ctx(level));
            assert!(!has(&args, "-daemon"), "{}", level);
            assert_eq!(value_of(&args, "-app"), Some("/workspace"));
        }
    }

    #[test]
    fn test_analyzer_pre_0_7() {
        let f = Fixture::new();
        let mut ctx = f.ctx("0.6");
        ctx.clean_cache = true;
        let args = phase_args(Phase::Analyze, &ctx);
        assert_eq!(value_of(&args, "-cache-dir"), Some("/cache"));
        assert_eq!(value_of(&args, "-group"), Some("/layers/group.toml"));
        assert!(has(&args, "-skip-layers"));
        assert!(!has(&args, "-previous-image"));
        assert!(!has(&args, "-run-image"));
        assert!(!has(&args, "-tag"));
        assert!(has(&args, "-daemon"));
        assert_eq!(args.last().map(String::as_str), Some("docker.io/library/my-app:latest"));
    }

    #[test]
    fn test_analyzer_0_7_to_0_11() {
        let f = Fixture::new();
        let args = phase_args(Phase::Analyze, &f.ctx("0.8"));
        assert!(!has(&args, "-cache-dir"));
        assert!(!has(&args, "-group"));
        assert_eq!(value_of(&args, "-previous-image"), Some("docker.io/library/my-app:latest"));
        assert_eq!(value_of(&args, "-run-image"), Some("example.com/run:base"));
        assert_eq!(value_of(&args, "-stack"), Some("/cnb/stack.toml"));
        assert_eq!(value_of(&args, "-tag"), Some("docker.io/library/my-app:v1"));
        assert!(!has(&args, "-launch-cache"));

        let args = phase_args(Phase::Analyze, &f.ctx("0.9"));
        assert_eq!(value_of(&args, "-launch-cache"), Some("/launch-cache"));
    }

    #[test]
    fn test_analyzer_0_12_uses_run_toml_unless_overridden() {
        let f = Fixture::new();
        let args = phase_args(Phase::Analyze, &f.ctx("0.12"));
        assert_eq!(value_of(&args, "-run"), Some("/cnb/run.toml"));
        assert!(!has(&args, "-run-image"));
        assert!(!has(&args, "-stack"));

        let mut ctx = f.ctx("0.12");
        ctx.run_image_override = true;
        let args = phase_args(Phase::Analyze, &ctx);
        assert!(!has(&args, "-run"));
        assert_eq!(value_of(&args, "-run-image"), Some("example.com/run:base"));
    }

    #[test]
    fn test_launch_cache_requires_daemon() {
        let f = Fixture::new();
        let mut ctx = f.ctx("0.10");
        ctx.use_daemon = false;
        let args = phase_args(Phase::Export, &ctx);
        assert!(!has(&args, "-launch-cache"));
        assert!(!has(&args, "-daemon"));
    }

    #[test]
    fn test_extension_flags() {
        let f = Fixture::new();
        let mut ctx = f.ctx("0.10");
        let args = phase_args(Phase::Detect, &ctx);
        assert!(!has(&args, "-generated"));

        ctx.has_extensions = true;
        let args = phase_args(Phase::Detect, &ctx);
        assert_eq!(value_of(&args, "-generated"), Some("/layers/generated"));
        assert_eq!(value_of(&args, "-analyzed"), Some("/layers/analyzed.toml"));

        let args = phase_args(Phase::Restore, &ctx);
        assert_eq!(
            value_of(&args, "-build-image"),
            Some("docker.io/library/magikpack-ephemeral-builder:abc")
        );
        assert!(!has(&args, "-daemon"));

        let args = phase_args(Phase::ExtendBuild, &ctx);
        assert!(!has(&args, "-kind"));

        let mut ctx = f.ctx("0.12");
        ctx.has_extensions = true;
        assert!(has(&phase_args(Phase::Restore, &ctx), "-daemon"));
        assert_eq!(value_of(&phase_args(Phase::ExtendBuild, &ctx), "-kind"), Some("build"));
        assert_eq!(value_of(&phase_args(Phase::ExtendRun, &ctx), "-kind"), Some("run"));
    }

    #[test]
    fn test_exporter_run_image_contract() {
        let f = Fixture::new();
        let args = phase_args(Phase::Export, &f.ctx("0.6"));
        assert_eq!(value_of(&args, "-run-image"), Some("example.com/run:base"));
        assert_eq!(value_of(&args, "-group"), Some("/layers/group.toml"));
        assert_eq!(
            &args[args.len() - 2..],
            ["docker.io/library/my-app:latest", "docker.io/library/my-app:v1"]
        );

        let args = phase_args(Phase::Export, &f.ctx("0.11"));
        assert!(!has(&args, "-run-image"));
        assert!(!has(&args, "-run"));
        assert_eq!(value_of(&args, "-analyzed"), Some("/layers/analyzed.toml"));

        let args = phase_args(Phase::Export, &f.ctx("0.12"));
        assert_eq!(value_of(&args, "-run"), Some("/cnb/run.toml"));

        let mut ctx = f.ctx("0.12");
        ctx.run_extended = true;
        let args = phase_args(Phase::Export, &ctx);
        assert!(!has(&args, "-run"));
        assert_eq!(value_of(&args, "-run-image"), Some("example.com/run:base"));
    }

    #[test]
    fn test_creator_flags() {
        let f = Fixture::new();
        let mut ctx = f.ctx("0.9");
        ctx.clean_cache = true;
        ctx.log_level = Some("debug");
        let args = phase_args(Phase::Create, &ctx);
        assert_eq!(&args[..2], ["-log-level", "debug"]);
        assert!(has(&args, "-skip-restore"));
        assert_eq!(value_of(&args, "-run-image"), Some("example.com/run:base"));
        assert_eq!(value_of(&args, "-launch-cache"), Some("/launch-cache"));
        assert_eq!(value_of(&args, "-uid"), Some("1001"));
        assert_eq!(value_of(&args, "-gid"), Some("1002"));
        assert!(has(&args, "-daemon"));

        let args = phase_args(Phase::Create, &f.ctx("0.12"));
        assert_eq!(value_of(&args, "-run"), Some("/cnb/run.toml"));
        assert!(!has(&args, "-run-image"));
    }

    #[test]
    fn test_builder_phase_is_minimal() {
        let f = Fixture::new();
        let args = phase_args(Phase::Build, &f.ctx("0.12"));
        assert_eq!(
            args,
            [
                "-app",
                "/workspace",
                "-layers",
                "/layers",
                "-platform",
                "/platform",
                "-group",
                "/layers/group.toml",
                "-plan",
                "/layers/plan.toml"
            ]
        );
    }
}
