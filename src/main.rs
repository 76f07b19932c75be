use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use sx126x_ctl::config::ConfigOverrides;
use sx126x_ctl::logging::{init_logger_with_level, log_debug, log_error, log_info, log_warn};
use sx126x_ctl::radio::cad::{CadController, CadExitMode, CadOutcome};
use sx126x_ctl::radio::hal::RaspberryPiHal;
use sx126x_ctl::radio::rx::RxContinuousController;
use sx126x_ctl::radio::session::IRQ_POLL_SLICE;
use sx126x_ctl::radio::tx::TxContinuousController;
use sx126x_ctl::{Hal, RadioConfig, RadioError, RadioEvent, RadioSession};

#[derive(Parser)]
#[command(name = "sx126x-ctl")]
#[command(about = "Transmit, receive or sense the channel with an SX126x radio")]
struct Cli {
    /// JSON configuration file
    #[arg(long)]
    cfg: Option<PathBuf>,
    /// Frequency in Hz
    #[arg(long, visible_alias = "f")]
    frequency: Option<u32>,
    /// Spreading factor
    #[arg(long)]
    sf: Option<u8>,
    /// Bandwidth in Hz
    #[arg(long)]
    bw: Option<u32>,
    /// Coding rate: denominator 5-8 (4/5..4/8) or index 1-4 (1 = 4/5, 4 = 4/8)
    #[arg(long)]
    cr: Option<u8>,
    /// Transmit power in dBm
    #[arg(long, allow_hyphen_values = true)]
    power: Option<i8>,
    /// Protocol 0: LoRa, 1: FSK
    #[arg(long)]
    prot: Option<u8>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send the message and a counter byte repeatedly
    Tx {
        #[arg(long, default_value = "HeLoRa World!")]
        message: String,
        #[arg(long, default_value = "5000")]
        interval_ms: u64,
    },
    /// Receive continuously and log every packet
    Rx,
    /// Run CAD cycles with the `cad_cfg` parameters
    Cad {
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
    },
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            frequency: self.frequency,
            spreading_factor: self.sf,
            bandwidth: self.bw,
            coding_rate: self.cr,
            power: self.power,
            protocol: self.prot,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger_with_level("info");

    let cli = Cli::parse();
    let mut config = match &cli.cfg {
        Some(path) => RadioConfig::from_path(path)
            .with_context(|| format!("Failed to read configuration {}", path.display()))?,
        None => RadioConfig::default(),
    };
    config.apply_overrides(&cli.overrides());

    let identity = config.to_identity()?;
    let hal = RaspberryPiHal::from_identity(&identity).context("Failed to open radio transport")?;
    log_info("Begin radio");
    let mut session = RadioSession::begin(hal, identity)?;
    config.apply_to(&mut session)?;

    let handle = session.handle();
    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log_info("Interrupt received, ending session");
            interrupt.end();
        }
    });

    let command = cli.command;
    let result = tokio::task::spawn_blocking(move || run(command, &config, session)).await?;
    handle.end();
    if let Err(e) = &result {
        log_error(&format!("Radio session failed: {e:#}"));
    }
    result
}

fn run<H: Hal + 'static>(
    command: Commands,
    config: &RadioConfig,
    mut session: RadioSession<H>,
) -> anyhow::Result<()> {
    let handle = session.handle();

    match command {
        Commands::Tx {
            message,
            interval_ms,
        } => {
            let mut payload = message.clone().into_bytes();
            payload.push(0);
            let mut tx = TxContinuousController::new();
            log_info(&format!("{} transmitter started", session.protocol()));
            loop {
                match tx.send_next(&mut session, &payload) {
                    Ok(stats) => {
                        log_info(&format!("{message}  {}", stats.counter));
                        log_info(&format!(
                            "Transmit time: {:.2} ms | Data rate: {:.2} byte/s",
                            stats.airtime_ms, stats.data_rate_bytes_per_sec
                        ));
                    }
                    Err(RadioError::SessionClosed) => break,
                    Err(e) if e.is_recoverable() => log_warn(&format!("Transmit failed: {e}")),
                    Err(e) => return Err(e.into()),
                }
                if handle.wait_closed(Duration::from_millis(interval_ms)) {
                    break;
                }
            }
        }
        Commands::Rx => {
            session.on_receive(log_event)?;
            let mut rx = RxContinuousController::new();
            rx.start(&mut session)?;
            log_info("Waiting for incoming packets...");
            while !handle.wait_closed(Duration::from_secs(1)) {}
        }
        Commands::Cad { interval_ms } => {
            let params = config.to_cad_parameters()?;
            session.on_receive(log_event)?;
            let mut cad = CadController::new();
            cad.configure(&mut session, params)?;
            log_info("CAD mode starting");

            loop {
                match cycle(&mut cad, &mut session, params.exit_mode) {
                    Err(RadioError::SessionClosed) => break,
                    Err(e) if e.is_recoverable() => log_warn(&format!("CAD cycle failed: {e}")),
                    Err(e) => return Err(e.into()),
                    Ok(()) => {}
                }
                if handle.wait_closed(Duration::from_millis(interval_ms)) {
                    break;
                }
            }

            let stats = cad.stats();
            log_info(&format!(
                "CAD: {} cycles, {} detections ({:.1}%), {} timeouts",
                stats.total_cad_operations,
                stats.activity_detected,
                stats.detection_rate() * 100.0,
                stats.timeouts
            ));
        }
    }

    session.end();
    Ok(())
}

/// One CAD cycle; after a detection in `ExitToRx` mode, services the RX window
fn cycle<H: Hal + 'static>(
    cad: &mut CadController,
    session: &mut RadioSession<H>,
    exit_mode: CadExitMode,
) -> Result<(), RadioError> {
    cad.run(session)?;
    let outcome = cad.wait_outcome(session, Duration::from_secs(1))?;
    if outcome == Some(CadOutcome::Detected) && exit_mode == CadExitMode::ExitToRx {
        loop {
            if let Some(flags) = session.service_irq(IRQ_POLL_SLICE)? {
                if flags.rx_done() || flags.timeout() {
                    break;
                }
            }
        }
    }
    Ok(())
}

fn log_event(event: RadioEvent) {
    match event {
        RadioEvent::Frame(frame) => {
            log_info(&format!("{}  {}", frame.message(), frame.counter));
            log_info(&format!(
                "Packet status: RSSI = {:.2} dBm | SNR = {:.2} dB",
                frame.rssi_dbm, frame.snr_db
            ));
            if frame.status.crc_error() {
                log_warn("CRC error");
            }
            if frame.status.header_error() {
                log_warn("Packet header error");
            }
        }
        RadioEvent::RxTimeout(flags) => log_info(&format!("RX timeout ({flags})")),
        RadioEvent::Cad(outcome) => log_debug(&format!("CAD outcome {outcome:?}")),
        RadioEvent::Fault(e) => log_warn(&format!("Receive failed: {e}")),
        RadioEvent::Status(flags) => log_info(&format!("IRQ: {flags}")),
    }
}
