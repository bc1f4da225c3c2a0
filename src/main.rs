//! hyfervisor: install and run macOS virtual machines from VM bundles.
//!
//! `install` builds a fresh bundle from a restore image, `run` boots an
//! installed bundle (resuming a saved snapshot when one exists) and `config`
//! inspects or edits the persisted settings.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use hyfervisor::logging;
use hyfervisor::paths::AppPaths;
use hyfervisor::settings::{SettingsStore, VmSettings};
use hyfervisor::vm::vfkit::DEFAULT_REST_PORT;
use hyfervisor::vm::{
    Hypervisor, InstallOptions, Installer, Launch, LifecycleManager, SimulatedHypervisor,
    Termination, VfkitHypervisor, VmBundle, VmState,
};

/// How often the run loop checks for a guest-initiated shutdown.
const GUEST_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// macOS virtual machine installer and runner
#[derive(Parser, Debug)]
#[command(name = "hyfervisor", version, about = "Install and run macOS virtual machines")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new bundle and install a restore image into it
    Install {
        /// Restore image (.ipsw) to install from
        image: PathBuf,
        /// Bundle directory to create (defaults to the configured bundle)
        bundle: Option<String>,
        /// Keep a copy of the restore image inside the bundle
        #[arg(long)]
        cache_image: bool,
        /// Use the in-process simulated hypervisor
        #[arg(long)]
        simulate: bool,
    },
    /// Boot an installed bundle, resuming a saved snapshot when present
    Run {
        /// Bundle directory (defaults to the configured bundle)
        bundle: Option<String>,
        /// Boot into the recovery environment
        #[arg(long)]
        recovery: bool,
        /// Use the in-process simulated hypervisor
        #[arg(long)]
        simulate: bool,
        /// Port for the vfkit REST control endpoint
        #[arg(long, default_value_t = DEFAULT_REST_PORT)]
        rest_port: u16,
    },
    /// Inspect or change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the current settings as TOML
    Show,
    /// Print the settings file location
    Path,
    /// Restore every setting to its default
    Reset,
    /// Set one setting, e.g. `config set memory_size 8G`
    Set { key: String, value: String },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = logging::init();

    let paths = AppPaths::resolve().context("HOME is not set; cannot locate settings")?;
    let mut store = SettingsStore::load(paths.config_file())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create Tokio runtime")?;

    let result = match args.command {
        Command::Install {
            image,
            bundle,
            cache_image,
            simulate,
        } => {
            let settings = store.settings().clone();
            let bundle = resolve_bundle(bundle.as_deref(), &settings);
            let options = InstallOptions {
                cache_restore_image: cache_image,
            };
            if simulate {
                runtime.block_on(install(SimulatedHypervisor::new(), settings, bundle, image, options))
            } else {
                let hv = VfkitHypervisor::detect(DEFAULT_REST_PORT)?;
                runtime.block_on(install(hv, settings, bundle, image, options))
            }
        }
        Command::Run {
            bundle,
            recovery,
            simulate,
            rest_port,
        } => {
            let settings = store.settings().clone();
            let bundle = resolve_bundle(bundle.as_deref(), &settings);
            if simulate {
                runtime.block_on(run(SimulatedHypervisor::new(), settings, bundle, recovery))
            } else {
                let hv = VfkitHypervisor::detect(rest_port)?;
                runtime.block_on(run(hv, settings, bundle, recovery))
            }
        }
        Command::Config { action } => config(&mut store, action),
    };

    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

fn resolve_bundle(arg: Option<&str>, settings: &VmSettings) -> VmBundle {
    VmBundle::resolve(arg.or(settings.vm_bundle_path()))
}

async fn install<H: Hypervisor>(
    hypervisor: H,
    settings: VmSettings,
    bundle: VmBundle,
    image: PathBuf,
    options: InstallOptions,
) -> Result<()> {
    println!(
        "Installing {} into {}",
        image.display(),
        bundle.root().display()
    );

    let mut installer = Installer::new(hypervisor, settings, bundle).with_options(options);
    let mut stdout = std::io::stdout();
    installer
        .run(&image, |fraction| {
            let _ = write!(stdout, "\rInstallation progress: {:>3.0}%", fraction * 100.0);
            let _ = stdout.flush();
        })
        .await?;

    println!("\nInstallation succeeded.");
    Ok(())
}

async fn run<H: Hypervisor>(
    hypervisor: H,
    settings: VmSettings,
    bundle: VmBundle,
    recovery: bool,
) -> Result<()> {
    let mut manager = LifecycleManager::new(hypervisor, settings, bundle);
    manager.configure()?;

    if recovery {
        manager.start_recovery().await?;
    } else {
        match manager.restore_or_start().await? {
            Launch::Restored => println!("Resumed from saved state."),
            Launch::ColdStart => {}
            Launch::ColdStartAfterFailedRestore => {
                println!("Saved state could not be restored; started fresh.")
            }
        }
    }
    println!(
        "Virtual machine running from {}. Press Ctrl-C to stop.",
        manager.bundle().root().display()
    );

    let mut signals = RestartSignals::install()?;
    let mut poll = tokio::time::interval(GUEST_POLL_INTERVAL);
    poll.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                match manager.terminate().await {
                    Termination::Saved => println!("\nState saved; `hyfervisor run` resumes it."),
                    Termination::Immediate => println!("\nStopping."),
                }
                break;
            }
            _ = poll.tick() => {
                if manager.poll_guest().await == VmState::Stopped {
                    println!("Guest shut down.");
                    break;
                }
            }
            Some(recovery_mode) = signals.next() => {
                info!(recovery_mode, "restart requested");
                manager.restart(recovery_mode).await?;
            }
        }
    }
    Ok(())
}

fn config(store: &mut SettingsStore, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => print!("{}", store.settings().to_toml()?),
        ConfigAction::Path => println!("{}", store.path().display()),
        ConfigAction::Reset => {
            store.reset_to_defaults()?;
            println!("Settings reset to defaults.");
        }
        ConfigAction::Set { key, value } => {
            store.update(|s| s.set_field(&key, &value))?;
            println!("{key} updated.");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Restart signals: SIGHUP restarts normally, SIGUSR1 into recovery
// ---------------------------------------------------------------------------

#[cfg(unix)]
struct RestartSignals {
    hangup: tokio::signal::unix::Signal,
    user1: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl RestartSignals {
    fn install() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            hangup: signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?,
            user1: signal(SignalKind::user_defined1())
                .context("failed to install SIGUSR1 handler")?,
        })
    }

    /// Next restart request; `true` means recovery mode.
    async fn next(&mut self) -> Option<bool> {
        tokio::select! {
            s = self.hangup.recv() => s.map(|()| false),
            s = self.user1.recv() => s.map(|()| true),
        }
    }
}

#[cfg(not(unix))]
struct RestartSignals;

#[cfg(not(unix))]
impl RestartSignals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Option<bool> {
        std::future::pending().await
    }
}
