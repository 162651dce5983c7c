//! Board monitor daemon.
//!
//! Watches USB boards and logs their lifecycle. An optional first argument
//! names a JSON configuration file; `BOARDMON_*` environment variables
//! override it.

use std::time::Duration;

use anyhow::Context as _;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use boardmon::tracing::{self, prelude::*};
use boardmon::{BoardEvent, BoardSummary, Context, Monitor, MonitorConfig};

/// How often the monitor thread looks at the cancellation token.
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

struct Notice {
    event: BoardEvent,
    board: BoardSummary,
}

fn load_config() -> anyhow::Result<MonitorConfig> {
    let mut config = match std::env::args_os().nth(1) {
        Some(path) => MonitorConfig::load_from(&path)
            .with_context(|| format!("loading {}", path.to_string_lossy()))?,
        None => MonitorConfig::default(),
    };
    config.apply_env().context("reading environment")?;
    Ok(config)
}

// udev handles are not Send, so the monitor lives and dies on its own thread
// and only board snapshots cross over to the runtime.
fn run_monitor(
    config: MonitorConfig,
    tx: mpsc::Sender<Notice>,
    running: CancellationToken,
) -> boardmon::Result<()> {
    let ctx = Context::new()?;
    let mut monitor = Monitor::with_config(&ctx, config.device_filter()?, &config)?;

    monitor.register_callback(move |board, event| {
        // A closed channel only means we are shutting down.
        let _ = tx.blocking_send(Notice {
            event,
            board: board.summary(),
        });
        Ok(())
    });

    monitor.start()?;
    while !monitor.wait(Some(SHUTDOWN_POLL), |_| Ok(running.is_cancelled()))? {}
    monitor.stop();
    Ok(())
}

fn log_notice(notice: &Notice) {
    let board = &notice.board;
    match notice.event {
        BoardEvent::Added => info!(
            board = %board.tag,
            model = board.model.unwrap_or("(unknown)"),
            capabilities = ?board.capabilities,
            "Board added."
        ),
        BoardEvent::Changed => info!(
            board = %board.tag,
            interface = board.description,
            capabilities = ?board.capabilities,
            "Board changed."
        ),
        BoardEvent::Disappeared => info!(board = %board.tag, "Board disappeared."),
        BoardEvent::Dropped => info!(board = %board.tag, "Board dropped."),
    }

    match serde_json::to_string(board) {
        Ok(json) => debug!(event = %notice.event, board = %json),
        Err(e) => warn!(error = %e, "Failed to serialize board."),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout("boardmond");

    let config = load_config()?;
    debug!(?config, "Configuration loaded.");

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    let (tx, mut rx) = mpsc::channel::<Notice>(64);

    let monitor_running = running.clone();
    let monitor = std::thread::Builder::new()
        .name("board-monitor".into())
        .spawn(move || {
            let result = run_monitor(config, tx, monitor_running.clone());
            if let Err(e) = &result {
                error!(error = %e, "Board monitor failed.");
                monitor_running.cancel();
            }
            trace!("Board monitor thread exiting.");
            result
        })
        .context("spawning monitor thread")?;

    tracker.spawn(async move {
        while let Some(notice) = rx.recv().await {
            log_notice(&notice);
        }
    });
    tracker.close();
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = running.cancelled() => {},
    }

    trace!("Shutting down.");
    running.cancel();

    let result = tokio::task::spawn_blocking(move || monitor.join())
        .await?
        .map_err(|_| anyhow::anyhow!("board monitor thread panicked"))?;
    tracker.wait().await;
    info!("Exiting.");

    Ok(result?)
}
