//! Binary entrypoint for the LifeSign controller daemon.
//!
//! Commands:
//! - `start [--data-dir <path>]` - run the controller (supervisor loop,
//!   mail worker, network controller)
//! - `status` - print the persisted countdown state and mail statistics
//! - `device-id` - print the device identity used for mDNS and the setup AP
//! - `test-mail [--to <addr>]` - SMTP connection test, optionally followed
//!   by a test message
//!
//! Deployment is expected to run under a process supervisor (systemd or
//! similar); a factory reset exits with a distinct code so the unit can be
//! restarted into first-time setup.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::sync::mpsc;

use lifesign::config::ConfigStore;
use lifesign::device::{DeviceId, SystemTimeSource};
use lifesign::mail::{start_mail_agent, OutboundMail, SmtpsTransport, TemplateKind};
use lifesign::net::{start_net_controller, SystemWifi};
use lifesign::relay::{LogPin, RelayDriver};
use lifesign::scheduler::{CountdownScheduler, SchedulerHandle};
use lifesign::supervisor::{Supervisor, SupervisorExit, SupervisorPolicy};

/// Exit code signalling a factory reset to the process supervisor.
const EXIT_RESTART: i32 = 10;

#[derive(Parser)]
#[command(name = "lifesign")]
#[command(about = "Dead-man's-switch controller daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory holding the persisted JSON settings
    #[arg(short, long, default_value = "./data", global = true)]
    data_dir: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Append logs to this file in addition to the console
    #[arg(long, global = true)]
    log_file: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller daemon
    Start,
    /// Show countdown state and statistics
    Status,
    /// Print the device identity
    DeviceId,
    /// Test the SMTP configuration
    TestMail {
        /// Also send a test message to this address
        #[arg(short, long)]
        to: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref());

    let store = ConfigStore::open(&cli.data_dir)?;
    let device_id = DeviceId::from_mac(store.load_or_create_device_mac()?);

    match cli.command {
        Commands::Start => {
            info!("Starting LifeSign v{}", env!("CARGO_PKG_VERSION"));
            info!("Device: {}", device_id);
            let exit = run_daemon(store, device_id).await?;
            if exit == SupervisorExit::Restart {
                info!("factory reset complete, exiting for restart");
                std::process::exit(EXIT_RESTART);
            }
        }
        Commands::Status => {
            let clock = Arc::new(SystemTimeSource::new());
            let scheduler = CountdownScheduler::load(store.clone(), clock);
            let status = scheduler.status();
            println!("device:      {}", device_id);
            println!(
                "countdown:   {}{}",
                if status.timer_active { "active" } else { "stopped" },
                if status.paused { " (paused)" } else { "" }
            );
            println!(
                "remaining:   {}s of {}s",
                status.remaining_seconds, status.total_seconds
            );
            println!(
                "alarms:      {}/{} acknowledged",
                status.next_alarm_index, status.total_alarms
            );
            println!("final:       {}", status.final_triggered);
            let mail = store.load_mail_config();
            println!(
                "mail groups: {} configured, {} enabled",
                mail.groups.len(),
                mail.enabled_groups().count()
            );
        }
        Commands::DeviceId => {
            println!("{}", device_id);
        }
        Commands::TestMail { to } => {
            let clock = Arc::new(SystemTimeSource::new());
            let scheduler =
                SchedulerHandle::new(CountdownScheduler::load(store.clone(), clock));
            let (events_tx, _events_rx) = mpsc::unbounded_channel();
            let (mail, _join) = start_mail_agent(
                store.load_mail_config(),
                Arc::new(SmtpsTransport),
                scheduler,
                device_id.as_str().to_string(),
                events_tx,
            );

            let result = mail.test_connection().await;
            if result.success {
                println!("SMTP handshake ok ({} ms)", result.send_time_ms);
            } else {
                println!(
                    "SMTP handshake failed: {}",
                    result.error.as_deref().unwrap_or("unknown")
                );
                std::process::exit(1);
            }

            if let Some(to) = to {
                let composed = lifesign::mail::templates::compose(
                    TemplateKind::Test,
                    &lifesign::config::MailGroup::default(),
                    &lifesign::mail::templates::TemplateContext {
                        device_id: device_id.as_str().to_string(),
                        remaining_seconds: 0,
                        total_seconds: 0,
                        wall_clock: Some(chrono::Utc::now()),
                    },
                );
                let result = mail
                    .send_sync(OutboundMail {
                        to: vec![to],
                        subject: composed.subject,
                        body: composed.body,
                        is_html: composed.is_html,
                        attachments: Vec::new(),
                        callback_url: None,
                    })
                    .await;
                if result.success {
                    println!("test message sent ({} ms)", result.send_time_ms);
                } else {
                    println!(
                        "test message failed: {}",
                        result.error.as_deref().unwrap_or("unknown")
                    );
                    std::process::exit(1);
                }
            }
            mail.shutdown();
        }
    }

    Ok(())
}

async fn run_daemon(store: ConfigStore, device_id: DeviceId) -> Result<SupervisorExit> {
    let clock: Arc<SystemTimeSource> = Arc::new(SystemTimeSource::new());

    let scheduler = SchedulerHandle::new(CountdownScheduler::load(store.clone(), clock.clone()));

    let (mail_events_tx, mail_events_rx) = mpsc::unbounded_channel();
    let (mail, mail_join) = start_mail_agent(
        store.load_mail_config(),
        Arc::new(SmtpsTransport),
        scheduler.clone(),
        device_id.as_str().to_string(),
        mail_events_tx,
    );

    let (net_events_tx, net_events_rx) = mpsc::unbounded_channel();
    let (net, net_join) = start_net_controller(
        Arc::new(SystemWifi),
        store.load_wifi_settings(),
        device_id.clone(),
        net_events_tx,
    );

    let relay = RelayDriver::new(Arc::new(LogPin), store.load_relay_config());

    let supervisor = Supervisor::new(
        scheduler,
        mail,
        net,
        relay,
        store,
        clock,
        SupervisorPolicy::default(),
        mail_events_rx,
        net_events_rx,
    );

    // Bring the network up in the background while the loop starts ticking.
    info!("controller running");
    let exit = supervisor.run().await;

    if let Err(e) = net_join.await {
        warn!("net controller join error: {}", e);
    }
    if let Err(e) = mail_join.await {
        error!("mail worker join error: {}", e);
    }
    Ok(exit)
}

fn init_logging(verbosity: u8, log_file: Option<&str>) {
    use std::io::Write;

    let mut builder = env_logger::Builder::new();
    let base_level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    if let Some(file) = log_file {
        if let Ok(f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file)
        {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            // Foreground runs mirror to the console; under a process
            // supervisor stdout is not a TTY and the file is the only sink.
            let is_tty = atty::is(atty::Stream::Stdout);

            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        } else {
            eprintln!("could not open log file {}, logging to console only", file);
            builder.format(default_format);
        }
    } else {
        builder.format(default_format);
    }
    let _ = builder.try_init();
}

fn default_format(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> std::io::Result<()> {
    use std::io::Write;
    writeln!(
        fmt,
        "{} [{}] {}",
        chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        record.level(),
        record.args()
    )
}
