use clap::{builder::PossibleValuesParser, value_parser, Arg, ArgAction, ArgMatches, Command};
use env_logger::{Builder, Env};
use indicatif::{ProgressBar, ProgressStyle};
use sandstrap::{
    bootstrap::{BootstrapState, Orchestrator, OrchestratorBuilder},
    config::{BindMode, GatewayConfig, Provider},
    errors::{BootstrapError, ErrorKind},
};
use std::{path::Path, process::exit};

const PROGRESS_STEPS: u64 = 1000;

fn cli() -> Command {
    let provider_names: Vec<&'static str> = Provider::ALL.iter().map(|p| p.id()).collect();
    let run_args = [
        Arg::new("provider")
            .long("provider")
            .value_name("NAME")
            .default_value("anthropic")
            .value_parser(PossibleValuesParser::new(provider_names))
            .help("Model provider for the gateway"),
        Arg::new("api_key")
            .long("api-key")
            .value_name("KEY")
            .env("SANDSTRAP_API_KEY")
            .hide_env_values(true)
            .required(true)
            .help("Credential for the model provider"),
        Arg::new("model")
            .long("model")
            .value_name("MODEL")
            .help("Model identifier, defaults to the provider's default"),
        Arg::new("port")
            .long("port")
            .value_name("PORT")
            .value_parser(value_parser!(u16))
            .help("Gateway port"),
        Arg::new("token")
            .long("token")
            .value_name("TOKEN")
            .help("Gateway auth token, generated when omitted"),
        Arg::new("lan")
            .long("lan")
            .action(ArgAction::SetTrue)
            .help("Listen on all interfaces instead of loopback only"),
    ];

    Command::new("sandstrap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Provision a layered root filesystem and run the gateway inside a sandbox")
        .subcommand_required(true)
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .short('l')
                .global(true)
                .value_name("LEVEL")
                .default_value("warn")
                .help("Log filter used when RUST_LOG is not set"),
        )
        .arg(
            Arg::new("home")
                .long("home")
                .global(true)
                .value_name("DIR")
                .help("Data directory [default: $SANDSTRAP_HOME or ~/.local/share/sandstrap]"),
        )
        .arg(
            Arg::new("assets")
                .long("assets")
                .global(true)
                .value_name("DIR")
                .help("Directory of bundled layer archives"),
        )
        .arg(
            Arg::new("manifest_url")
                .long("manifest-url")
                .global(true)
                .value_name("URL")
                .help("Where to fetch the layer manifest"),
        )
        .arg(
            Arg::new("proot")
                .long("proot")
                .global(true)
                .value_name("PATH")
                .help("Sandbox engine binary [default: $SANDSTRAP_PROOT or proot]"),
        )
        .arg(
            Arg::new("offline")
                .long("offline")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Use the built-in layer list and bundled archives only"),
        )
        .subcommand(
            Command::new("bootstrap")
                .about("Install missing or outdated layers, then start the services")
                .args(run_args.clone()),
        )
        .subcommand(
            Command::new("quick-start")
                .about("Start the services on an already installed root filesystem")
                .args(run_args),
        )
        .subcommand(Command::new("status").about("Show installed layers and marker files"))
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();

    let log_level = matches
        .get_one::<String>("log_level")
        .map(String::as_str)
        .unwrap_or("warn");
    Builder::from_env(Env::default().default_filter_or(log_level)).init();

    let orchestrator = match builder(&matches).build() {
        Ok(orchestrator) => orchestrator,
        Err(err) => fail(&err),
    };

    match matches.subcommand() {
        Some(("status", _)) => status(&orchestrator),
        Some(("bootstrap", sub)) => {
            let config = gateway_config(sub);
            run(&orchestrator, |o| o.bootstrap(config)).await
        }
        Some(("quick-start", sub)) => {
            let config = gateway_config(sub);
            run(&orchestrator, |o| o.quick_start(config)).await
        }
        _ => unreachable!("subcommand is required"),
    }
}

fn builder(matches: &ArgMatches) -> OrchestratorBuilder {
    let mut builder = Orchestrator::builder();
    if let Some(dir) = matches.get_one::<String>("home") {
        builder = builder.data_dir(Path::new(dir));
    }
    if let Some(dir) = matches.get_one::<String>("assets") {
        builder = builder.assets_dir(Path::new(dir));
    }
    if let Some(url) = matches.get_one::<String>("manifest_url") {
        builder = builder.manifest_url(url);
    }
    if let Some(path) = matches.get_one::<String>("proot") {
        builder = builder.proot(Path::new(path));
    }
    if matches.get_flag("offline") {
        builder = builder.offline();
    }
    builder
}

fn gateway_config(matches: &ArgMatches) -> GatewayConfig {
    let provider = matches
        .get_one::<String>("provider")
        .and_then(|name| name.parse().ok())
        .unwrap_or(Provider::Anthropic);
    let api_key = matches
        .get_one::<String>("api_key")
        .cloned()
        .unwrap_or_default();
    let mut config = GatewayConfig::new(provider, api_key);
    if let Some(model) = matches.get_one::<String>("model") {
        config.model = model.clone();
    }
    if let Some(port) = matches.get_one::<u16>("port") {
        config.port = *port;
    }
    if let Some(token) = matches.get_one::<String>("token") {
        config.auth_token = token.clone();
    }
    if matches.get_flag("lan") {
        config.bind = BindMode::Lan;
    }
    config
}

fn status(orchestrator: &Orchestrator) {
    println!("data directory: {}", orchestrator.paths().root.display());
    let ledger = orchestrator.ledger();
    if ledger.is_empty() {
        println!("no layers installed");
    }
    for (name, entry) in ledger.entries() {
        println!(
            "layer {}@{} installed {}",
            name,
            entry.version,
            entry.installed_at.to_rfc3339()
        );
    }
    for missing in orchestrator.missing_markers() {
        println!("missing {}", missing.display());
    }
    if orchestrator.is_provisioned() {
        println!("provisioned");
    } else {
        println!("not provisioned");
    }
}

async fn run<F>(orchestrator: &Orchestrator, start: F)
where
    F: FnOnce(&Orchestrator) -> Result<(), BootstrapError>,
{
    let mut status = orchestrator.subscribe_status();
    let mut logs = orchestrator.subscribe_logs();
    if let Err(err) = start(orchestrator) {
        fail(&err);
    }

    let bar = ProgressBar::new(PROGRESS_STEPS);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {percent:>3}% {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let progress_bar = bar.clone();
    let observer = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    progress_bar.set_position((current.progress * PROGRESS_STEPS as f64) as u64);
                    progress_bar.set_message(current.state.to_string());
                }
                line = logs.recv() => match line {
                    Ok(line) => progress_bar.println(line),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                }
            }
        }
    });

    let result = tokio::select! {
        result = orchestrator.wait() => result,
        _ = tokio::signal::ctrl_c() => {
            bar.println("interrupted");
            Ok(())
        }
    };
    observer.abort();
    bar.finish_and_clear();

    if let Err(err) = result {
        let _ = orchestrator.stop().await;
        fail(&err);
    }

    if orchestrator.status().state == BootstrapState::Running {
        if let Some(config) = orchestrator.config() {
            println!("gateway listening on port {}", config.port);
            println!("auth token {}", config.auth_token);
        }
        println!("press ctrl-c to stop");
        let mut status = orchestrator.subscribe_status();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = status.wait_for(|s| s.state != BootstrapState::Running) => {
                if let Some(message) = orchestrator.status().error() {
                    eprintln!("{}", message);
                }
            }
        }
    }

    if let Err(err) = orchestrator.stop().await {
        fail(&err);
    }
}

fn fail(err: &BootstrapError) -> ! {
    if log::log_enabled!(log::Level::Error) {
        log::error!("{}", err);
    } else {
        // `-l off` still gets the reason on stderr
        eprintln!("{}", err);
    }
    exit(match err.kind() {
        ErrorKind::Usage => 2,
        _ => 1,
    })
}
