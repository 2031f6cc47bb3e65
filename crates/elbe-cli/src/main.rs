mod commands;

use clap::{Parser, Subcommand};
use commands::{EXIT_DESCRIPTOR_ERROR, EXIT_FAILURE, EXIT_SANDBOX_ERROR};
use elbe_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "elbe-build",
    version,
    about = "Build embedded root filesystems from an installed Debian tree"
)]
struct Cli {
    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Extract, finalize and package a target.
    Build {
        /// Path to the build descriptor.
        #[arg(default_value = "elbe.toml")]
        descriptor: PathBuf,
        /// Installed tree the target is carved out of.
        #[arg(long)]
        source: PathBuf,
        /// Target directory to populate.
        #[arg(long)]
        target: PathBuf,
        /// Directory receiving artifacts and license reports.
        #[arg(long, default_value = ".")]
        builddir: PathBuf,
        /// Extract on top of an existing target instead of starting from scratch.
        #[arg(long, default_value_t = false)]
        keep_target: bool,
    },
    /// Only copy the selected part of the source into the target.
    Extract {
        /// Path to the build descriptor.
        #[arg(default_value = "elbe.toml")]
        descriptor: PathBuf,
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        target: PathBuf,
        #[arg(long, default_value_t = false)]
        keep_target: bool,
    },
    /// Run a command inside a target through the chroot sandbox.
    Chroot {
        /// Target directory.
        target: PathBuf,
        /// User-mode emulator to inject for a foreign-architecture target.
        #[arg(long)]
        interpreter: Option<String>,
        /// Command and arguments to run (after --).
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },
    /// Collect the license texts of every package in a target.
    Licenses {
        /// Target directory.
        target: PathBuf,
        /// Write the flat text report here instead of stdout.
        #[arg(long)]
        text: Option<PathBuf>,
        /// Write the structured JSON manifest here.
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Check that the host can run builds.
    Doctor,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ELBE_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();
    let json_output = cli.json;

    let needs_host_tools = matches!(
        cli.command,
        Commands::Build { .. } | Commands::Extract { .. } | Commands::Chroot { .. }
    );
    if needs_host_tools && std::env::var("ELBE_SKIP_PREREQS").as_deref() != Ok("1") {
        let missing = elbe_runtime::check_build_prereqs();
        if !missing.is_empty() {
            eprintln!("error: {}", elbe_runtime::format_missing(&missing));
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    let result = match cli.command {
        Commands::Build {
            descriptor,
            source,
            target,
            builddir,
            keep_target,
        } => commands::build::run(
            &descriptor,
            source,
            target,
            builddir,
            !keep_target,
            json_output,
        ),
        Commands::Extract {
            descriptor,
            source,
            target,
            keep_target,
        } => commands::extract::run(&descriptor, source, target, !keep_target, json_output),
        Commands::Chroot {
            target,
            interpreter,
            command,
        } => commands::chroot::run(&target, interpreter, &command),
        Commands::Licenses {
            target,
            text,
            manifest,
        } => commands::licenses::run(&target, text.as_deref(), manifest.as_deref(), json_output),
        Commands::Doctor => commands::doctor::run(json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("build descriptor error:") {
                EXIT_DESCRIPTOR_ERROR
            } else if msg.starts_with("sandbox lifecycle:") {
                EXIT_SANDBOX_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
