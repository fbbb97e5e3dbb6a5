// Copyright (c) The sdc-soak Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{ExpectedError, Result},
    output::{NO_HEADING_TARGET, OutputContext, OutputOpts, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand, ValueEnum};
use sdc_soak_metadata::RunKind;
use sdc_soak_runner::{
    config::{
        ConfigOverrides, EnvironmentSource, HarnessConfig, app_data_dir, discover_cert_folder,
        home_dir,
    },
    device::{epr_urn, sim::SimStack},
    errors::WriteReportError,
    harness::Harness,
    reporter::{HumanReporter, RunReport, write_junit},
    signal::SignalHandlerKind,
    stop::StopSignal,
};
use std::{
    io::{BufWriter, Write},
    sync::Arc,
};
use tracing::info;

/// A conformance and soak-test harness for SDC (IEEE 11073) medical-device communication.
///
/// Every command starts a reference provider in the background and exercises it from the
/// consumer side. Settings come from the built-in defaults, then --config-file, then `ref_*`
/// environment variables, then the flags below.
#[derive(Debug, Parser)]
#[command(version, styles = clap_styles::style(), max_term_width = 100)]
pub struct SdcSoakApp {
    #[clap(flatten)]
    output: OutputOpts,

    #[clap(flatten)]
    common: CommonOpts,

    #[clap(subcommand)]
    command: Command,
}

impl SdcSoakApp {
    /// Executes the app.
    ///
    /// Returns the exit code.
    pub fn exec(self) -> Result<i32> {
        // The log directory is part of the config, so logging can only be set up once the config
        // has been read. Errors are reported after that.
        let config = self.make_config(EnvironmentSource::Process);
        let output = self
            .output
            .init(config.as_ref().ok().and_then(|config| config.log_dir.as_deref()));
        let config = config?;
        config.log_effective();

        let kind = self.command.kind();
        info!(
            target: NO_HEADING_TARGET,
            "Starting {} run, provider `{}`",
            kind,
            epr_urn(config.search_epr),
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("sdc-soak-worker")
            .build()
            .map_err(|err| ExpectedError::TokioRuntimeCreate { err })?;
        let report = runtime.block_on(run(kind, config))?;

        self.common.write_report(&report, output)?;
        Ok(report.exit_code())
    }

    fn make_config(&self, environment: EnvironmentSource) -> Result<HarnessConfig> {
        let overrides = self.command.overrides()?;
        let config =
            HarnessConfig::from_sources(self.common.config_file.as_deref(), environment, &overrides)?;
        Ok(config)
    }
}

async fn run(kind: RunKind, config: HarnessConfig) -> Result<RunReport> {
    let stop = StopSignal::new();
    // The signal handler must be built from within the runtime.
    let signal_task = SignalHandlerKind::Standard
        .build()?
        .raise_on_shutdown(stop.clone());

    let harness = Harness::new(Arc::new(SimStack::new()), config, stop);
    let report = match kind {
        RunKind::Failure => harness.run_failure().await,
        RunKind::Throughput => harness.run_throughput().await,
        _ => harness.run_suite().await,
    };
    signal_task.abort();

    Ok(report?)
}

#[derive(Debug, Args)]
struct CommonOpts {
    /// Config file, layered over the built-in defaults
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,

    /// Format of the summary printed to stdout
    #[arg(
        long,
        value_enum,
        default_value_t,
        global = true,
        value_name = "FMT",
        help_heading = "OUTPUT OPTIONS"
    )]
    message_format: MessageFormat,

    /// Also write a JUnit report to this path
    #[arg(long, global = true, value_name = "PATH", help_heading = "OUTPUT OPTIONS")]
    junit: Option<Utf8PathBuf>,
}

impl CommonOpts {
    fn write_report(&self, report: &RunReport, output: OutputContext) -> Result<()> {
        let mut writer = BufWriter::new(std::io::stdout().lock());
        match self.message_format {
            MessageFormat::Human => {
                let mut reporter = HumanReporter::new();
                if output.colorize_stdout() {
                    reporter.colorize();
                }
                reporter
                    .write_summary(report, &mut writer)
                    .map_err(WriteReportError::from)?;
            }
            MessageFormat::Json => report.write_json(&mut writer)?,
        }
        writer.flush().map_err(WriteReportError::from)?;

        if let Some(path) = &self.junit {
            write_junit(report, path)?;
            info!("wrote JUnit report to `{path}`");
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, Default, ValueEnum)]
enum MessageFormat {
    /// A colored summary for humans
    #[default]
    Human,
    /// The machine-readable JSON summary
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full conformance suite against the reference provider
    ///
    /// The provider runs in the background while the consumer discovers it, connects, checks
    /// contexts, counts metric and alert updates, invokes operations and unsubscribes.
    Suite(SuiteOpts),

    /// Inject faults into the reference provider
    ///
    /// Every tick writes new vitals; one tick in five also writes a wrongly-typed value, which
    /// the provider must reject. Every few seconds the provider goes offline briefly.
    Failure(FailureOpts),

    /// Measure the update rate of the reference provider
    Throughput(ThroughputOpts),
}

impl Command {
    fn kind(&self) -> RunKind {
        match self {
            Self::Suite(_) => RunKind::Suite,
            Self::Failure(_) => RunKind::Failure,
            Self::Throughput(_) => RunKind::Throughput,
        }
    }

    fn overrides(&self) -> Result<ConfigOverrides> {
        let mut overrides = ConfigOverrides::new();
        match self {
            Self::Suite(opts) => {
                opts.connection.apply(&mut overrides)?;
                set_opt(&mut overrides, "startup.timeout", opts.timeout);
                set_opt(&mut overrides, "metric_wait", opts.wait);
                set_opt(&mut overrides, "min_updates", opts.min_updates);
            }
            Self::Failure(opts) => {
                opts.connection.apply(&mut overrides)?;
                set_opt(&mut overrides, "fault.duration", opts.duration);
            }
            Self::Throughput(opts) => {
                opts.connection.apply(&mut overrides)?;
                set_opt(&mut overrides, "throughput.send_interval", opts.send_interval);
                set_opt(&mut overrides, "throughput.duration", opts.perf_duration);
            }
        }
        Ok(overrides)
    }
}

#[derive(Debug, Args)]
struct SuiteOpts {
    #[clap(flatten)]
    connection: ConnectionOpts,

    /// Seconds to wait for the provider to report readiness [default: 10]
    #[arg(long, value_name = "SECS")]
    timeout: Option<f64>,

    /// Seconds to collect metric and alert updates [default: 20]
    #[arg(long, value_name = "SECS")]
    wait: Option<f64>,

    /// Minimum updates per metric and alert [default: wait / 5 - 1]
    #[arg(long, value_name = "N")]
    min_updates: Option<usize>,
}

#[derive(Debug, Args)]
struct FailureOpts {
    #[clap(flatten)]
    connection: ConnectionOpts,

    /// Seconds to inject faults for [default: 30]
    #[arg(long, value_name = "SECS")]
    duration: Option<f64>,
}

#[derive(Debug, Args)]
struct ThroughputOpts {
    #[clap(flatten)]
    connection: ConnectionOpts,

    /// Seconds between provider updates while sampling [default: 0.5]
    #[arg(long, value_name = "SECS")]
    send_interval: Option<f64>,

    /// Seconds to sample updates for [default: 5]
    #[arg(long, value_name = "SECS")]
    perf_duration: Option<f64>,
}

#[derive(Debug, Args)]
#[command(next_help_heading = "CONNECTION OPTIONS")]
struct ConnectionOpts {
    /// Use TLS with certificates from the first `certs` folder found
    ///
    /// Searched in order: `./certs`, `../certs`, `../../certs`, `~/.sdc11073/certs`, and on
    /// Windows `%APPDATA%\SDC11073\certs`.
    #[arg(long)]
    tls: bool,

    /// Bind discovery to a loopback adapter
    #[arg(long)]
    loopback: bool,

    /// Also write the log to `sdc-soak.log` in this directory
    #[arg(long, value_name = "DIR")]
    logdir: Option<Utf8PathBuf>,

    /// Passphrase of the TLS private key
    #[arg(long, value_name = "PASSPHRASE")]
    ssl_passwd: Option<String>,

    /// Don't capture protocol traffic
    #[arg(long)]
    no_commlog: bool,
}

impl ConnectionOpts {
    fn apply(&self, overrides: &mut ConfigOverrides) -> Result<()> {
        if self.tls {
            let cwd = std::env::current_dir().map_err(|err| ExpectedError::CurrentDir { err })?;
            let cwd = Utf8PathBuf::try_from(cwd).map_err(|err| ExpectedError::CurrentDir {
                err: err.into_io_error(),
            })?;
            let folder =
                discover_cert_folder(&cwd, home_dir().as_deref(), app_data_dir().as_deref())
                    .map_err(|err| ExpectedError::TlsSetup { err })?;
            overrides.set("ca", folder);
        }
        if self.loopback {
            overrides.set("use_loopback", true);
        }
        set_opt(overrides, "log_dir", self.logdir.as_deref().map(Utf8Path::as_str));
        set_opt(overrides, "ssl_passwd", self.ssl_passwd.as_deref());
        if self.no_commlog {
            overrides.set("enable_commlog", false);
        }
        Ok(())
    }
}

fn set_opt<T: ToString>(overrides: &mut ConfigOverrides, key: &str, value: Option<T>) {
    if let Some(value) = value {
        overrides.set(key, value);
    }
}
