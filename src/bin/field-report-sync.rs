use clap::{Arg, ArgMatches, Command};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use field_report_sync::connectivity::{HttpProbe, NetworkProbe};
use field_report_sync::notify::ChannelNotifier;
use field_report_sync::prelude::*;

fn cli() -> Command<'static> {
    Command::new("field-report-sync")
        .version(env!("CARGO_PKG_VERSION"))
        .about("List, submit and watch field reports against a Supabase project")
        .arg(
            Arg::new("cache")
                .long("cache")
                .value_name("FILE")
                .help("Local report cache")
                .takes_value(true)
                .default_value("field-reports.json")
                .global(true),
        )
        .arg(
            Arg::new("email")
                .long("email")
                .value_name("EMAIL")
                .help("Sign in with this email")
                .takes_value(true)
                .requires("password")
                .global(true),
        )
        .arg(
            Arg::new("password")
                .long("password")
                .value_name("PASSWORD")
                .help("Password for --email")
                .takes_value(true)
                .global(true),
        )
        .subcommand_required(true)
        .subcommand(Command::new("list").about("Refresh and print the report list"))
        .subcommand(
            Command::new("submit")
                .about("Submit a report, or save it locally when offline")
                .arg(Arg::new("type").long("type").takes_value(true).required(true))
                .arg(Arg::new("location").long("location").takes_value(true).required(true))
                .arg(Arg::new("title").long("title").takes_value(true).required(true))
                .arg(
                    Arg::new("description")
                        .long("description")
                        .takes_value(true)
                        .default_value(""),
                )
                .arg(
                    Arg::new("file")
                        .long("file")
                        .value_name("NAME:SIZE:TYPE")
                        .help("Attachment metadata, repeatable")
                        .takes_value(true)
                        .multiple_occurrences(true),
                ),
        )
        .subcommand(
            Command::new("watch")
                .about("Follow changes until interrupted")
                .arg(
                    Arg::new("interval")
                        .long("interval")
                        .value_name("SECONDS")
                        .help("Connectivity check period")
                        .takes_value(true)
                        .default_value("15"),
                ),
        )
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli().get_matches()).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(matches: ArgMatches) -> Result<(), Error> {
    let config = BackendConfig::from_env()?;
    let options = SyncOptions::default();
    let backend = Arc::new(SupabaseBackend::new_with_options(&config, &options));

    if let (Some(email), Some(password)) = (matches.value_of("email"), matches.value_of("password")) {
        backend.sign_in_with_password(email, password).await?;
    }
    let user = backend.current_user().await;

    let probe = Arc::new(
        HttpProbe::new(backend.http_client(), &config.base_url(), &options.probe_path)
            .with_api_key(&config.anon_key),
    );
    let online = probe.probe().await;
    let connectivity = ConnectivityMonitor::new_with_options(online, probe.clone(), &options);

    let (notifier, mut notices) = ChannelNotifier::new();
    tokio::spawn(async move {
        while let Some(notice) = notices.recv().await {
            eprintln!("[{}] {}", notice.title, notice.description);
        }
    });

    let cache_path = matches.value_of("cache").unwrap_or("field-reports.json");
    let engine = SyncEngine::builder(backend.clone(), connectivity)
        .store(Arc::new(FileStore::open(cache_path)?))
        .notifier(Arc::new(notifier))
        .options(options)
        .user(user)
        .build();

    let result = match matches.subcommand() {
        Some(("list", _)) => list(&engine).await,
        Some(("submit", args)) => submit(&engine, args).await,
        Some(("watch", args)) => watch(&engine, probe, args).await,
        _ => Err(Error::config("unknown command")),
    };

    engine.shutdown().await;
    result
}

async fn list(engine: &SyncEngine) -> Result<(), Error> {
    let outcome = engine.start().await;
    debug!("Initial refresh: {:?}", outcome);
    print_reports(&engine.reports());
    Ok(())
}

async fn submit(engine: &SyncEngine, args: &ArgMatches) -> Result<(), Error> {
    let files = args
        .values_of("file")
        .map(|values| values.map(parse_file).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();

    let draft = NewReport {
        report_type: args.value_of("type").unwrap_or_default().to_string(),
        location: args.value_of("location").unwrap_or_default().to_string(),
        title: args.value_of("title").unwrap_or_default().to_string(),
        description: args.value_of("description").unwrap_or_default().to_string(),
        files,
    };

    match engine.submitter().add_report(draft).await? {
        SubmitOutcome::Submitted => println!("Report submitted"),
        SubmitOutcome::SavedOffline(report) => println!("Saved offline as {}", report.id),
    }
    Ok(())
}

async fn watch(engine: &SyncEngine, probe: Arc<HttpProbe>, args: &ArgMatches) -> Result<(), Error> {
    let seconds: u64 = args
        .value_of("interval")
        .unwrap_or("15")
        .parse()
        .map_err(|e| Error::config(format!("invalid --interval: {}", e)))?;

    engine.start().await;
    print_reports(&engine.reports());

    let mut state = engine.subscribe_state();
    let mut ticker = interval(Duration::from_secs(seconds.max(1)));
    let mut shown = engine.reports();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
            _ = ticker.tick() => {
                let reachable = probe.probe().await;
                let offline = engine.connectivity().is_offline();
                if reachable && offline {
                    engine.network_online().await;
                } else if !reachable && !offline {
                    engine.network_offline().await;
                }
            }
            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let reports = state.borrow_and_update().reports.clone();
                if reports != shown {
                    print_reports(&reports);
                    shown = reports;
                }
            }
        }
    }
}

fn parse_file(value: &str) -> Result<FileMeta, Error> {
    let mut parts = value.rsplitn(3, ':');
    let (Some(file_type), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(Error::config(format!("expected NAME:SIZE:TYPE, got {}", value)));
    };
    let size = size
        .parse()
        .map_err(|e| Error::config(format!("invalid size in {}: {}", value, e)))?;
    Ok(FileMeta {
        name: name.to_string(),
        size,
        file_type: file_type.to_string(),
    })
}

fn print_reports(reports: &[Report]) {
    if reports.is_empty() {
        println!("No reports");
        return;
    }
    for report in reports {
        let marker = if report.is_pending() { " (pending)" } else { "" };
        println!(
            "{}  {:<12} {:<20} {}{}",
            report.submitted_at.format("%Y-%m-%d %H:%M"),
            report.report_type,
            report.location,
            report.title,
            marker
        );
    }
}
