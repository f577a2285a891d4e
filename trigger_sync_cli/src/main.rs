use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use crossbeam_channel::Receiver;
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use libtrigger_sync::block_list::ChannelBlockList;
use libtrigger_sync::config::Config;
use libtrigger_sync::controller::{
    PushReport, ReconciliationController, TriggerMode, WorkflowOutcome,
};
use libtrigger_sync::rpc_client::RpcClient;
use libtrigger_sync::status_feed::{
    ConsoleFilter, Feed, RecordFeed, StatusEvent, StatusFeed, ZmqSubscriber,
};
use libtrigger_sync::worker_status::WorkflowStatus;
use libtrigger_sync::workflow::{HyperactiveParams, LevelTriggerParams};

type CliResult = Result<(), Box<dyn Error>>;

/// A live connection: RPC client, synchronized controller, and the running status feed
struct Session {
    controller: ReconciliationController<RpcClient>,
    events: Receiver<StatusEvent>,
    _feed: Feed<StatusFeed>,
}

fn make_template_config(path: &Path) -> CliResult {
    Config::default().write_config_file(path)?;
    Ok(())
}

type FeedParts = (Feed<StatusFeed>, Receiver<StatusEvent>, ConsoleFilter);

fn start_status_feed(config: &Config) -> Result<FeedParts, Box<dyn Error>> {
    let console = ConsoleFilter::new(&config.quiet_topics, config.verbose_message_limit);
    let mut sink = StatusFeed::new(&config.always_deliver_topics, console.clone());
    let events = sink.subscribe();
    let mut feed = Feed::new(sink);
    feed.start(
        ZmqSubscriber::connect(&config.host, config.status_port())?,
        config.feed_poll_interval(),
    )?;
    Ok((feed, events, console))
}

fn connect(config: &Config) -> Result<Session, Box<dyn Error>> {
    let (feed, events, console) = start_status_feed(config)?;
    let rpc = RpcClient::connect(&config.host, config.rpc_port(), config.rpc_timeout())?;
    let block_list = ChannelBlockList::new(&config.get_block_list_path());
    let mut controller =
        ReconciliationController::new(rpc, block_list, console, config.sync_grace_period());
    log::info!("Waiting for channel names and trigger state...");
    if !controller.synchronize(&events, config.startup_timeout())? {
        return Err(format!(
            "Server did not send channel names and trigger state within {:.1} seconds",
            config.startup_timeout_secs
        )
        .into());
    }
    log::info!(
        "Synchronized: {} channels, {} distinct trigger records",
        controller.registry().len(),
        controller.store().record_count()
    );
    Ok(Session {
        controller,
        events,
        _feed: feed,
    })
}

/// Pressing Enter sends on the returned channel
fn stop_on_enter() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::spawn(move || {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok() {
            let _ = tx.send(());
        }
    });
    rx
}

/// Draw workflow progress until the workflow drops its sender
fn spawn_progress_bar(
    pb_manager: &MultiProgress,
) -> (mpsc::Sender<WorkflowStatus>, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel::<WorkflowStatus>();
    let pb = pb_manager.add(ProgressBar::new(100));
    let handle = std::thread::spawn(move || {
        for status in rx {
            pb.set_position((status.progress * 100.0) as u64);
            pb.set_message(status.step.to_string());
        }
        pb.finish();
    });
    (tx, handle)
}

fn log_push_report(report: &PushReport) {
    log::info!("Sent {} ConfigureTriggers calls", report.calls);
    for failure in report.failures.iter() {
        log::error!("{failure}");
    }
}

fn run_blocked(config: &Config, matches: &ArgMatches) -> CliResult {
    let mut list = ChannelBlockList::new(&config.get_block_list_path());
    let numbers = |m: &ArgMatches| -> Vec<u32> {
        m.get_many::<u32>("numbers")
            .map(|v| v.copied().collect())
            .unwrap_or_default()
    };
    let changed = match matches.subcommand() {
        Some(("block", sub)) => list.block(&numbers(sub))?,
        Some(("unblock", sub)) => list.unblock(&numbers(sub))?,
        Some(("toggle", sub)) => match sub.get_one::<u32>("number") {
            Some(n) => list.toggle(*n)?,
            None => false,
        },
        Some(("undo", _)) => {
            list.undo()?;
            true
        }
        Some(("clear", _)) => list.clear()?,
        _ => false,
    };
    if changed {
        log::info!("Block list updated at {}", list.path().display());
    }
    log::info!(
        "Blocked channels: {:?} ({} earlier versions kept)",
        list.blocked(),
        list.history_depth()
    );
    Ok(())
}

fn run_watch(config: &Config) -> CliResult {
    let (mut feed, events, _console) = start_status_feed(config)?;
    log::info!("Watching the status feed. Press Enter to stop.");
    let stop = stop_on_enter();
    let mut delivered = 0;
    loop {
        crossbeam_channel::select! {
            recv(events) -> msg => match msg {
                Ok(_) => delivered += 1,
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    feed.stop()?;
    log::info!("{delivered} status messages delivered.");
    Ok(())
}

fn run_session_command(
    config: &Config,
    name: &str,
    matches: &ArgMatches,
    pb_manager: &MultiProgress,
) -> CliResult {
    let mut session = connect(config)?;
    let controller = &mut session.controller;
    match name {
        "mode" => {
            let mode: TriggerMode = matches
                .get_one::<String>("mode")
                .map(|m| m.parse())
                .transpose()?
                .unwrap_or(TriggerMode::Pulse);
            match matches.get_one::<String>("channels") {
                Some(spec) => controller.select_spec(spec),
                None => controller.select_unblocked_signals(),
            }
            let report = controller.go_mode(mode)?;
            log_push_report(&report);
        }
        "disable-hyperactive" => {
            let threshold = *matches.get_one::<i64>("threshold").unwrap_or(&0);
            let positive = !matches.get_flag("negative");
            let params = HyperactiveParams::from_config(config, threshold, positive);
            log::info!("Press Enter to stop observing early.");
            let cancel = stop_on_enter();
            let (progress, bar) = spawn_progress_bar(pb_manager);
            let outcome = controller.disable_hyperactive_channels(
                &params,
                &session.events,
                &cancel,
                Some(&progress),
            );
            drop(progress);
            let _ = bar.join();
            match outcome? {
                WorkflowOutcome::Completed(report) => {
                    log::info!(
                        "Disabled channel numbers {:?}; {} channels kept edge triggers",
                        report.blocked_numbers,
                        report.enabled.len()
                    );
                    log_push_report(&report.pushes);
                }
                WorkflowOutcome::Failed { reason } => return Err(reason.into()),
            }
        }
        "level-triggers" => {
            let threshold = *matches.get_one::<i64>("threshold").unwrap_or(&0);
            let positive = !matches.get_flag("negative");
            let mut params = LevelTriggerParams::from_config(config, threshold, positive);
            if let Some(records) = matches.get_one::<u64>("records") {
                params.records_per_channel = *records as usize;
            }
            let mut sink = RecordFeed::new();
            let records = sink.subscribe();
            let mut record_feed = Feed::new(sink);
            record_feed.start(
                ZmqSubscriber::connect(&config.host, config.record_port())?,
                config.feed_poll_interval(),
            )?;
            log::info!("Press Enter to stop collecting early.");
            let cancel = stop_on_enter();
            let (progress, bar) = spawn_progress_bar(pb_manager);
            let outcome = controller.configure_level_triggers(
                &params,
                &session.events,
                &records,
                &cancel,
                Some(&progress),
            );
            drop(progress);
            let _ = bar.join();
            record_feed.stop()?;
            match outcome? {
                WorkflowOutcome::Completed(report) => {
                    for (index, level) in report.levels.iter() {
                        log::info!(
                            "{}: level {level}",
                            controller.registry().name(*index).unwrap_or("?")
                        );
                    }
                    log_push_report(&report.pushes);
                }
                WorkflowOutcome::Failed { reason } => return Err(reason.into()),
            }
        }
        "label" => {
            let label = matches
                .get_one::<String>("text")
                .map(|s| s.as_str())
                .unwrap_or("");
            controller.set_experiment_state_label(label)?;
        }
        "pause" => controller.pause_writing()?,
        "unpause" => {
            let label = matches
                .get_one::<String>("label")
                .map(|s| s.as_str())
                .unwrap_or("");
            controller.unpause_writing(label)?;
        }
        _ => (),
    }
    Ok(())
}

fn threshold_args(command: Command) -> Command {
    command
        .arg(
            Arg::new("threshold")
                .short('t')
                .long("threshold")
                .required(true)
                .allow_negative_numbers(true)
                .value_parser(value_parser!(i64))
                .help("Trigger threshold in raw ADC units"),
        )
        .arg(
            Arg::new("negative")
                .long("negative")
                .action(ArgAction::SetTrue)
                .help("Pulses are negative going"),
        )
}

fn number_list(name: &'static str) -> Command {
    Command::new(name).arg(
        Arg::new("numbers")
            .num_args(1..)
            .required(true)
            .value_parser(value_parser!(u32)),
    )
}

fn main() {
    // Create a cli
    let matches = Command::new("trigger_sync_cli")
        .arg_required_else_help(true)
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .default_value("trigger_sync.yml")
                .help("Path to the configuration file"),
        )
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(Command::new("watch").about("Log the status feed until Enter is pressed"))
        .subcommand(
            Command::new("mode")
                .about("Put channels into a trigger mode")
                .arg(
                    Arg::new("mode")
                        .required(true)
                        .value_parser(["noise", "pulse", "auto1pps"]),
                )
                .arg(
                    Arg::new("channels")
                        .short('c')
                        .long("channels")
                        .help("Channel specification like \"chan:1,2,3\"; default all unblocked"),
                ),
        )
        .subcommand(threshold_args(
            Command::new("disable-hyperactive")
                .about("Find channels that trigger on noise and block them"),
        ))
        .subcommand(
            threshold_args(
                Command::new("level-triggers")
                    .about("Set level triggers relative to each channel's baseline"),
            )
            .arg(
                Arg::new("records")
                    .short('r')
                    .long("records")
                    .value_parser(value_parser!(u64).range(1..))
                    .help("Records per channel used for the baseline"),
            ),
        )
        .subcommand(
            Command::new("blocked")
                .about("Show or edit the block list")
                .subcommand_required(true)
                .subcommand(Command::new("list"))
                .subcommand(number_list("block"))
                .subcommand(number_list("unblock"))
                .subcommand(
                    Command::new("toggle").arg(
                        Arg::new("number")
                            .required(true)
                            .value_parser(value_parser!(u32)),
                    ),
                )
                .subcommand(Command::new("undo"))
                .subcommand(Command::new("clear")),
        )
        .subcommand(
            Command::new("label")
                .about("Set the experiment state label")
                .arg(Arg::new("text").required(true)),
        )
        .subcommand(Command::new("pause").about("Pause writing"))
        .subcommand(
            Command::new("unpause")
                .about("Resume writing")
                .arg(Arg::new("label")),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }

    // Parse the cli
    let config_path = PathBuf::from(
        matches
            .get_one::<String>("path")
            .map(|s| s.as_str())
            .unwrap_or("trigger_sync.yml"),
    );

    let (name, sub_matches) = match matches.subcommand() {
        Some(sub) => sub,
        None => return,
    };

    if name == "new" {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match make_template_config(&config_path) {
            Ok(()) => log::info!("Done."),
            Err(e) => log::error!("Could not write template config: {e}"),
        }
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!(
        "Server: {} (RPC port {}, status port {}, record port {})",
        config.host,
        config.rpc_port(),
        config.status_port(),
        config.record_port()
    );
    log::info!(
        "Block list: {}",
        config.get_block_list_path().to_string_lossy()
    );

    let result = match name {
        "blocked" => run_blocked(&config, sub_matches),
        "watch" => run_watch(&config),
        _ => run_session_command(&config, name, sub_matches, &pb_manager),
    };

    match result {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("{name} failed: {e}"),
    }
}
