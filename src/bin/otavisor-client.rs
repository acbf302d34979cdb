use argh::FromArgs;
use futures_util::StreamExt;
use otavisor::dbus::SupervisorDBusProxy;
use owo_colors::OwoColorize;
use std::process;
use zbus::Connection;

/// Otavisor Client - Drive and monitor the otavisor update supervisor
#[derive(FromArgs)]
struct OtavisorCli {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum SubCommand {
    Boot(BootCmd),
    Shutdown(ShutdownCmd),
    UserPresent(UserPresentCmd),
    Connectivity(ConnectivityCmd),
    Media(MediaCmd),
    Install(InstallCmd),
    Postpone(PostponeCmd),
    Front(FrontCmd),
    Recheck(RecheckCmd),
    RegStore(RegStoreCmd),
    State(StateCmd),
    Info(InfoCmd),
    DeviceInfo(DeviceInfoCmd),
    Accept(AcceptCmd),
    Defer(DeferCmd),
    Check(CheckCmd),
    Cancel(CancelCmd),
    Confirm(ConfirmCmd),
    Dismiss(DismissCmd),
    Watch(WatchCmd),
}

/// Signal that boot completed
#[derive(FromArgs)]
#[argh(subcommand, name = "boot")]
struct BootCmd {}

/// Signal an imminent system shutdown
#[derive(FromArgs)]
#[argh(subcommand, name = "shutdown")]
struct ShutdownCmd {}

/// Signal that the user unlocked the device
#[derive(FromArgs)]
#[argh(subcommand, name = "user-present")]
struct UserPresentCmd {}

/// Report a connectivity change
#[derive(FromArgs)]
#[argh(subcommand, name = "connectivity")]
struct ConnectivityCmd {
    /// the link went down
    #[argh(switch)]
    down: bool,
}

/// Report mounted media
#[derive(FromArgs)]
#[argh(subcommand, name = "media")]
struct MediaCmd {
    /// media URI, e.g. file:///mnt/usb
    #[argh(positional)]
    uri: String,
}

/// Install the staged update now
#[derive(FromArgs)]
#[argh(subcommand, name = "install")]
struct InstallCmd {}

/// Postpone the pending update
#[derive(FromArgs)]
#[argh(subcommand, name = "postpone")]
struct PostponeCmd {}

/// Ask for the update screen
#[derive(FromArgs)]
#[argh(subcommand, name = "front")]
struct FrontCmd {}

/// Re-check connectivity
#[derive(FromArgs)]
#[argh(subcommand, name = "recheck")]
struct RecheckCmd {}

/// Send registration store values to the engine
#[derive(FromArgs)]
#[argh(subcommand, name = "reg-store")]
struct RegStoreCmd {
    /// registration store values, in order
    #[argh(positional)]
    values: Vec<String>,
}

/// Show the supervisor state
#[derive(FromArgs)]
#[argh(subcommand, name = "state")]
struct StateCmd {}

/// Query agent info keys
#[derive(FromArgs)]
#[argh(subcommand, name = "info")]
struct InfoCmd {
    /// agent info keys
    #[argh(positional)]
    keys: Vec<String>,
}

/// Show the device info report
#[derive(FromArgs)]
#[argh(subcommand, name = "device-info")]
struct DeviceInfoCmd {}

/// Accept the update prompt
#[derive(FromArgs)]
#[argh(subcommand, name = "accept")]
struct AcceptCmd {}

/// Defer the update prompt
#[derive(FromArgs)]
#[argh(subcommand, name = "defer")]
struct DeferCmd {}

/// Check for updates now
#[derive(FromArgs)]
#[argh(subcommand, name = "check")]
struct CheckCmd {}

/// Cancel the running check, or abort the running download
#[derive(FromArgs)]
#[argh(subcommand, name = "cancel")]
struct CancelCmd {
    /// abort the download instead of the check
    #[argh(switch)]
    download: bool,
}

/// Confirm the install after a completed download
#[derive(FromArgs)]
#[argh(subcommand, name = "confirm")]
struct ConfirmCmd {}

/// Dismiss the error or up to date message
#[derive(FromArgs)]
#[argh(subcommand, name = "dismiss")]
struct DismissCmd {}

/// Act as the update screen: attach and print everything the supervisor shows
#[derive(FromArgs)]
#[argh(subcommand, name = "watch")]
struct WatchCmd {}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli: OtavisorCli = argh::from_env();

    let result = run(cli.command).await;

    if let Err(e) = result {
        eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
        process::exit(1);
    }
}

async fn run(command: SubCommand) -> CliResult {
    let connection = Connection::system().await?;
    let proxy = SupervisorDBusProxy::new(&connection).await?;

    match command {
        SubCommand::Boot(_) => sent("BootCompleted", proxy.boot_completed().await),
        SubCommand::Shutdown(_) => sent("Shutdown", proxy.shutdown().await),
        SubCommand::UserPresent(_) => sent("UserPresent", proxy.user_present().await),
        SubCommand::Connectivity(cmd) => sent(
            "ConnectivityChanged",
            proxy.connectivity_changed(cmd.down).await,
        ),
        SubCommand::Media(cmd) => sent("MediaMounted", proxy.media_mounted(cmd.uri).await),
        SubCommand::Install(_) => sent("StartInstall", proxy.start_install().await),
        SubCommand::Postpone(_) => sent("Postpone", proxy.postpone().await),
        SubCommand::Front(_) => sent("BringToFront", proxy.bring_to_front().await),
        SubCommand::Recheck(_) => sent("CheckConnectivity", proxy.check_connectivity().await),
        SubCommand::RegStore(cmd) => sent("ManageRegStore", proxy.manage_reg_store(cmd.values).await),
        SubCommand::State(_) => show_state(&proxy).await,
        SubCommand::Info(cmd) => show_agent_info(&proxy, cmd.keys).await,
        SubCommand::DeviceInfo(_) => {
            print!("{}", proxy.get_device_info().await?);
            Ok(())
        }
        SubCommand::Accept(_) => sent("AnswerPrompt", proxy.answer_prompt(true).await),
        SubCommand::Defer(_) => sent("AnswerPrompt", proxy.answer_prompt(false).await),
        SubCommand::Check(_) => sent("CheckForUpdate", proxy.check_for_update().await),
        SubCommand::Cancel(cmd) if cmd.download => {
            sent("CancelDownload", proxy.cancel_download().await)
        }
        SubCommand::Cancel(_) => sent("CancelCheck", proxy.cancel_check().await),
        SubCommand::Confirm(_) => sent("ConfirmInstall", proxy.confirm_install().await),
        SubCommand::Dismiss(_) => sent("Dismiss", proxy.dismiss().await),
        SubCommand::Watch(_) => watch(&proxy).await,
    }
}

fn sent(what: &str, result: zbus::fdo::Result<()>) -> CliResult {
    result?;
    println!("{} {}", "✓".bright_green().bold(), what.bright_white());
    Ok(())
}

async fn show_state(proxy: &SupervisorDBusProxy<'_>) -> CliResult {
    let (connectivity, suppressed, postponed, mandatory, version) = proxy.get_state().await?;

    println!("{}", "Supervisor State".bright_white().bold());
    println!();

    let connectivity_colored = match connectivity.as_str() {
        "Connected" => connectivity.bright_green().to_string(),
        "NotConnected" => connectivity.bright_red().to_string(),
        _ => connectivity.dimmed().to_string(),
    };
    println!("  {} {}", "Connectivity:".bright_white(), connectivity_colored);
    println!("  {} {}", "Suppressed:".bright_white(), flag(suppressed));
    println!("  {} {}", "Postponed:".bright_white(), flag(postponed));
    println!("  {} {}", "Mandatory:".bright_white(), flag(mandatory));

    if !version.is_empty() {
        println!("  {} {}", "Pending update:".bright_white(), version.bright_cyan().bold());
    }

    Ok(())
}

fn flag(value: bool) -> String {
    if value {
        "yes".bright_yellow().to_string()
    } else {
        "no".dimmed().to_string()
    }
}

async fn show_agent_info(proxy: &SupervisorDBusProxy<'_>, keys: Vec<String>) -> CliResult {
    let values = proxy.get_agent_info(keys.clone()).await?;
    for (key, value) in keys.iter().zip(values) {
        println!("  {} {}", format!("{key}:").bright_white(), value.cyan());
    }
    Ok(())
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}

async fn watch(proxy: &SupervisorDBusProxy<'_>) -> CliResult {
    let mut notifications = proxy.receive_notification_shown().await?;
    let mut hidden = proxy.receive_notification_hidden().await?;
    let mut prompts = proxy.receive_prompt_shown().await?;
    let mut progress = proxy.receive_progress().await?;
    let mut errors = proxy.receive_terminal_error().await?;
    let mut complete = proxy.receive_download_complete().await?;
    let mut missing = proxy.receive_artifact_missing().await?;
    let mut front = proxy.receive_front_requested().await?;

    proxy.screen_visibility(true).await?;

    println!("{}", "Watching the update session...".bright_white().bold());
    println!("{}", "(Press Ctrl+C to exit)".dimmed());
    println!();

    loop {
        tokio::select! {
            Some(signal) = notifications.next() => {
                let args = signal.args()?;
                println!("[{}] {} {}", timestamp().dimmed(), "Notification".bright_cyan(), args.text);
            }
            Some(_) = hidden.next() => {
                println!("[{}] {}", timestamp().dimmed(), "Notification hidden".dimmed());
            }
            Some(signal) = prompts.next() => {
                let args = signal.args()?;
                println!("[{}] {} {}", timestamp().dimmed(), args.kind.bright_yellow().bold(), "prompt".bright_yellow());
                println!("{}", args.text);
                println!("{}", "(answer with `otavisor-client accept` or `defer`)".dimmed());
            }
            Some(signal) = progress.next() => {
                let args = signal.args()?;
                println!(
                    "[{}] {} {}% {}",
                    timestamp().dimmed(),
                    "Downloading".bright_cyan(),
                    args.percent.to_string().bright_green(),
                    create_progress_bar(args.percent)
                );
            }
            Some(signal) = errors.next() => {
                let args = signal.args()?;
                println!(
                    "[{}] {} {} ({})",
                    timestamp().dimmed(),
                    "✗".bright_red().bold(),
                    args.message.bright_red(),
                    args.class
                );
                if !args.details.is_empty() {
                    println!("  {}", args.details.dimmed());
                }
            }
            Some(_) = complete.next() => {
                println!(
                    "[{}] {} {}",
                    timestamp().dimmed(),
                    "✓".bright_green().bold(),
                    "Download complete, run `otavisor-client confirm` to restart and install".bright_green()
                );
            }
            Some(_) = missing.next() => {
                println!("[{}] {}", timestamp().dimmed(), "The downloaded update disappeared".bright_red());
            }
            Some(_) = front.next() => {
                println!("[{}] {}", timestamp().dimmed(), "Update screen requested".bright_magenta());
            }
            _ = tokio::signal::ctrl_c() => break,
            else => break,
        }
    }

    proxy.screen_visibility(false).await?;
    Ok(())
}

fn create_progress_bar(progress: i32) -> String {
    let filled = (progress.clamp(0, 100) / 5) as usize;
    let empty = 20 - filled;
    let bar = format!(
        "{}{}",
        "█".repeat(filled).bright_green(),
        "░".repeat(empty).dimmed()
    );
    format!("[{}]", bar)
}
