use anyhow::{anyhow, Result};
use crossterm::{style, QueueableCommand};
use std::io::{stdout, Write};
use std::path::PathBuf;
use structopt::StructOpt;

use dockhand::backends::DockerCliRuntime;
use dockhand::config::{self, Configuration};
use dockhand::lifecycle;
use dockhand::services::OutputSink;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "dockhand",
    about = "Runs container units described by declarative order lists.",
    setting = structopt::clap::AppSettings::DisableHelpSubcommand
)]
struct Opt {
    /// Configuration directory (defaults to ~/.dockhand, then /etc/dockhand).
    #[structopt(short = "c", long, parse(from_os_str))]
    configdir: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Creates a starter configuration directory.
    Init,
    /// Runs a unit command, e.g. webserver/start.
    Run {
        unitcommand: String,

        /// Runtime endpoint, e.g. unix:///var/run/docker.sock.
        #[structopt(short = "H", long)]
        daemon: Option<String>,

        #[structopt(short = "e", long, parse(from_os_str))]
        /// Extra environment file merged over the configured environments.
        environment: Option<PathBuf>,

        #[structopt(long)]
        /// Print the resolved configuration instead of executing it.
        print_only: bool,
    },
    /// Lists the available units and services.
    List {
        #[structopt(long)]
        units: bool,

        #[structopt(long)]
        services: bool,
    },
    /// Shows the README of a unit or service.
    Help { name: String },
}

/// Prefixes every delivered line with its originating command.
struct ConsoleSink;

fn write_line(command: &str, line: &str) -> crossterm::Result<()> {
    let mut out = stdout();
    out.queue(style::PrintStyledContent(
        style::style(format!("{}: ", command))
            .with(style::Color::Cyan)
            .attribute(style::Attribute::Bold),
    ))?
    .queue(style::Print(format!("{}\n", line)))?;
    out.flush()?;
    Ok(())
}

impl OutputSink for ConsoleSink {
    fn line(&mut self, command: &str, line: &str) {
        if let Err(error) = write_line(command, line) {
            log::warn!("could not write output: {}", error);
        }
    }
}

fn print_header(text: &str) -> crossterm::Result<()> {
    let mut out = stdout();
    out.queue(style::PrintStyledContent(
        style::style(format!("{}\n", text))
            .with(style::Color::Green)
            .attribute(style::Attribute::Bold),
    ))?;
    out.flush()?;
    Ok(())
}

fn main() {
    pretty_env_logger::init_custom_env("DOCKHAND_LOG");

    if let Err(error) = run(Opt::from_args()) {
        log::error!("{:#}", error);
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> Result<()> {
    let configuration = Configuration::new(opt.configdir)?;

    match opt.command {
        Command::Init => {
            configuration.initialize()?;
            println!("initialized {}", configuration.base_dir().display());
        }
        Command::Run {
            unitcommand,
            daemon,
            environment,
            print_only,
        } => {
            let mut env = configuration.environment()?;
            if let Some(file) = environment {
                config::merge_environment_file(&mut env, &file)?;
            }

            let (configurations, order_list) =
                configuration.read_unit_configuration(&unitcommand, &env)?;

            if print_only {
                print!("{}", serde_yaml::to_string(&configurations)?);
                println!("---");
                print!("{}", serde_yaml::to_string(&order_list)?);
                return Ok(());
            }

            let host = daemon.or_else(|| {
                env.get("DOCKER_HOST")
                    .and_then(serde_yaml::Value::as_str)
                    .map(str::to_string)
            });
            let mut runtime = DockerCliRuntime::new(host);
            let mut sink = ConsoleSink;

            log::info!("running {} ({} orders)", unitcommand, order_list.len());
            lifecycle::run_order_list(
                &mut runtime,
                &mut sink,
                configuration.base_dir(),
                &configurations,
                &order_list,
            )?;
        }
        Command::List { units, services } => {
            let both = !units && !services;
            if units || both {
                print_header("Units:")?;
                for unit in configuration.list_units(true)? {
                    println!("  {}", unit);
                }
            }
            if services || both {
                print_header("Services:")?;
                for service in configuration.list_services()? {
                    println!("  {}", service);
                }
            }
        }
        Command::Help { name } => {
            let text = configuration
                .readme("units", &name)
                .or_else(|| configuration.readme("services", &name))
                .ok_or_else(|| anyhow!("no documentation found for {}", name))?;
            print!("{}", text);
        }
    }

    Ok(())
}
