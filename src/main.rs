use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use jetvane::channel::{ChannelSpec, Direction};
use jetvane::constants::{FLASH_MAX_READ_WRITE_SIZE, MAX_FRAME_LEN, channel_ids, message_ids};
use jetvane::recorder::{self, StateRecorder};
use jetvane::state::Simulator;
use jetvane::telemetry::{self, StateTx, TelemetryLink};
use jetvane::transport::{Baudrate, SerialTransport, Transport, pipe};
use jetvane::{Command, Config, FlightCommands, Frame, FrameReader, IoHandle, SharedState};

#[derive(Parser)]
#[command(
    name = "jetvane",
    about = "Flight computer core of a jet-vane rocket: telemetry, ground commands and data logging"
)]
struct Cli {
    /// YAML configuration file, the built-in defaults are used when absent
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the configured log level
    #[arg(short, long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring up storage, then record and stream state until the flash is offloaded
    Run {
        /// Drive the state from a random walk
        #[arg(long)]
        simulate: bool,
        /// Telemetry serial port, overrides the configuration
        #[arg(short, long)]
        port: Option<String>,
        #[arg(short, long, value_enum)]
        baudrate: Option<Baudrate>,
        /// Skip the storage self tests
        #[arg(long)]
        skip_self_test: bool,
        /// Without a serial port: seconds of flight before the loopback
        /// ground station requests the offload
        #[arg(long, default_value_t = 10)]
        flight_secs: u64,
    },
    /// Run the flash and SD card self tests
    SelfTest {},
    /// Encode a message and print the frame in hex
    Encode {
        #[arg(long)]
        id: u8,
        /// Payload as hex, or a file holding it
        payload: String,
    },
    /// Decode every frame in a hex stream, or a file holding one
    Decode { input: String },
    /// Hexdump a range of the flash image
    DumpFlash {
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 256)]
        len: usize,
    },
    /// Copy recorded states from the flash image to the SD card as CSV
    Offload {
        /// Number of states, defaults to every state on the flash
        #[arg(long)]
        states: Option<usize>,
    },
}

fn progress_bar(message: &'static str) -> Result<ProgressBar> {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{msg} [{bar:40.cyan/blue}] {pos}/{len}")?
            .progress_chars("=> "),
    );
    bar.set_message(message);
    Ok(bar)
}

fn erase_progress() -> Result<impl FnMut(usize, usize) + Send + 'static> {
    let bar = progress_bar("Erasing flash")?;
    Ok(move |done: usize, total: usize| {
        bar.set_length(total as u64);
        bar.set_position(done as u64);
        if done == total {
            bar.finish_and_clear();
        }
    })
}

fn run_self_tests(io: &IoHandle) -> bool {
    let results = [
        ("Flash", recorder::self_test_flash(io)),
        ("SD", recorder::self_test_sd(io)),
    ];
    let mut passed = true;
    for (name, result) in results {
        match result {
            Ok(()) => log::info!("{} test PASS", name),
            Err(e) => {
                log::error!("{} test FAIL: {:#}", name, e);
                passed = false;
            }
        }
    }
    passed
}

/// Ground side of the loopback link: starts the flight, requests the
/// offload after `flight` and logs everything received.
fn loopback_ground(mut ground: impl Transport, flight: Duration) -> Result<()> {
    let command = |id: Command, uuid: u8| Frame::encode(message_ids::COMMAND, &[id as u8, uuid]);
    ground.send_frame(&command(Command::IdleToGround, 0)?)?;

    let mut reader = FrameReader::<MAX_FRAME_LEN>::new();
    let mut buf = [0u8; 256];
    let started = std::time::Instant::now();
    let mut offload_sent = false;
    loop {
        if !offload_sent && started.elapsed() >= flight {
            log::info!("Ground: requesting SD card offload");
            ground.send_frame(&command(Command::FlashSdCard, 1)?)?;
            offload_sent = true;
        }
        let n = match ground.recv_raw(&mut buf) {
            Ok(n) => n,
            // Flight side has shut down
            Err(_) => return Ok(()),
        };
        for message in reader.iter_messages(&buf[..n]) {
            match message {
                Ok(m) => log::debug!("Ground <= {:#04x}: {}", m.id, hex::encode(&m.payload)),
                Err(e) => log::warn!("Ground: bad frame: {}", e),
            }
        }
    }
}

fn run(
    config: &Config,
    simulate: bool,
    port: Option<String>,
    skip_self_test: bool,
    flight_secs: u64,
) -> Result<()> {
    let (io, worker) = config.periph_io(false, erase_progress()?).spawn()?;
    if !skip_self_test {
        run_self_tests(&io);
    }

    let state = SharedState::default();
    let stop = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let (signal_tx, signals) = mpsc::channel();
    let (downlink, outbound) = telemetry::downlink();

    let mut threads = Vec::new();
    let transport: Box<dyn Transport> = match port.or_else(|| config.telemetry.port.clone()) {
        Some(port) => Box::new(SerialTransport::open(&port, config.telemetry.baudrate)?),
        None => {
            log::info!("No telemetry port, using a loopback ground station");
            let (flight, ground) = pipe();
            let flight_time = Duration::from_secs(flight_secs);
            threads.push(
                thread::Builder::new()
                    .name("ground".into())
                    .spawn(move || loopback_ground(ground, flight_time))?,
            );
            Box::new(flight)
        }
    };

    let handler = FlightCommands::new(signal_tx).start_state_tx(started.clone());
    let link = TelemetryLink::new(transport, handler, outbound);
    threads.push(
        thread::Builder::new()
            .name("telemetry".into())
            .spawn(move || link.run().map(|stats| log::info!("Link stats: {:?}", stats)))?,
    );

    {
        let tx = StateTx::new(state.clone(), downlink);
        let (started, stop) = (started.clone(), stop.clone());
        let period = config.telemetry_period();
        threads.push(
            thread::Builder::new()
                .name("state-tx".into())
                .spawn(move || tx.run(period, &started, &stop))?,
        );
    }

    if simulate {
        let (state, stop) = (state.clone(), stop.clone());
        threads.push(thread::Builder::new().name("simulator".into()).spawn(move || {
            let mut simulator = Simulator::new();
            while !stop.load(Ordering::Relaxed) {
                state.update(|s| simulator.step(s));
                thread::sleep(Duration::from_millis(10));
            }
            Ok(())
        })?);
    }

    let bar = progress_bar("Writing to SD card")?;
    let result = StateRecorder::new(&io).and_then(|recorder| {
        recorder.run(&state, &signals, config.record_period(), |done, total| {
            bar.set_length(total as u64);
            bar.set_position(done as u64);
        })
    });
    bar.finish_and_clear();

    stop.store(true, Ordering::Relaxed);
    for thread in threads {
        match thread.join() {
            Ok(Err(e)) => log::warn!("Task failed: {:#}", e),
            Err(_) => log::error!("Task panicked"),
            Ok(Ok(())) => {}
        }
    }
    drop(io);
    let _ = worker.join();

    let n_states = result?;
    log::info!("Recorded {} states", n_states);
    Ok(())
}

fn dump_flash(config: &Config, offset: usize, len: usize) -> Result<()> {
    let (io, _worker) = config.periph_io(true, |_, _| {}).spawn()?;
    let mut read = io.create_channel(ChannelSpec::flash(channel_ids::FLASH_READ, Direction::Read))?;

    let mut data = vec![0u8; len];
    let mut done = 0;
    while done < len {
        let n = (len - done).min(FLASH_MAX_READ_WRITE_SIZE);
        read.load(offset + done, n)?.wait()?;
        done += read.drain_read(&mut data[done..done + n]);
    }

    let mut out = Vec::new();
    hxdmp::hexdump(&data, &mut out)?;
    println!("{}", String::from_utf8_lossy(&out));
    Ok(())
}

fn offload(config: &Config, states: Option<usize>) -> Result<()> {
    let flash = &config.flash;
    anyhow::ensure!(
        flash.image.is_some(),
        "offload needs a flash image, RAM flash does not outlive a run"
    );
    let (io, _worker) = config.periph_io(true, |_, _| {}).spawn()?;
    let mut recorder = StateRecorder::new(&io)?;

    let n_states = match states {
        Some(n) => n,
        None => {
            let n = recorder.recorded_states()?;
            log::info!("Found {} states on flash", n);
            n
        }
    };

    let bar = progress_bar("Writing to SD card")?;
    bar.set_length(n_states as u64);
    let written = recorder.offload(n_states, |done, _| bar.set_position(done as u64))?;
    bar.finish_and_clear();
    log::info!("Wrote {} bytes", written);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::builtin()?,
    };
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    let _ = simplelog::TermLogger::init(
        config.level()?,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    match cli.command {
        Commands::Run {
            simulate,
            port,
            baudrate,
            skip_self_test,
            flight_secs,
        } => {
            if let Some(baudrate) = baudrate {
                config.telemetry.baudrate = baudrate;
            }
            run(&config, simulate, port, skip_self_test, flight_secs)?;
        }
        Commands::SelfTest {} => {
            let (io, _worker) = config.periph_io(false, erase_progress()?).spawn()?;
            anyhow::ensure!(run_self_tests(&io), "self test failed");
        }
        Commands::Encode { id, payload } => {
            let payload = jetvane::format::read_input(&payload)?;
            let frame = Frame::encode(id, &payload)?;
            println!("{}", hex::encode(frame.as_slice()));
        }
        Commands::Decode { input } => {
            let raw = jetvane::format::read_input(&input)?;
            let mut reader = FrameReader::<MAX_FRAME_LEN>::new();
            for message in reader.iter_messages(&raw) {
                match message {
                    Ok(m) => println!("{:#04x} [{}] {}", m.id, m.payload.len(), hex::encode(&m.payload)),
                    Err(e) => log::warn!("Dropped frame: {}", e),
                }
            }
            if reader.pending() > 0 {
                log::warn!("{} trailing bytes without a complete frame", reader.pending());
            }
        }
        Commands::DumpFlash { offset, len } => dump_flash(&config, offset, len)?,
        Commands::Offload { states } => offload(&config, states)?,
    }

    Ok(())
}
