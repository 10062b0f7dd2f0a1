//! DV source that captures audio from an ALSA device and pairs it with
//! black video.
//!
//! The mixer only speaks DV, so a pure audio feed still has to arrive
//! as full frames: each cycle captures the scheduled number of PCM
//! samples, overlays them onto a black-frame template and ships the
//! frame over the source connection. A software buffer in front of the
//! capture device absorbs the configured delay plus one hardware
//! period of jitter.

use std::io::Write;
use std::net::TcpStream;
use std::process;

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tracing_subscriber::EnvFilter;

use dvmix::config::MixerSettings;
use dvmix::dif::{self, DvSystem, SampleRate, AUDIO_CHANNELS, DIF_MAX_FRAME_SIZE};
use dvmix::protocol::constants::GREETING_SOURCE;

#[derive(Parser)]
#[command(
    name = "dvmix-source-alsa",
    about = "Feed black-video DV frames carrying live ALSA audio into a dvmix mixer",
    disable_help_flag = true
)]
struct Args {
    /// Print usage information
    #[arg(long, action = ArgAction::HelpLong)]
    help: Option<bool>,

    /// Mixer host to connect to (overrides configuration files)
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// Mixer TCP port (overrides configuration files)
    #[arg(short = 'p', long)]
    port: Option<String>,

    /// DV system to produce
    #[arg(short = 's', long, value_enum, ignore_case = true, default_value = "pal")]
    system: SystemName,

    /// Audio sample rate in Hz (48000 or 32000)
    #[arg(short = 'r', long, default_value_t = 48_000)]
    rate: u32,

    /// Audio delay in seconds
    #[arg(short = 'd', long, default_value_t = 0.2)]
    delay: f64,

    /// ALSA capture device
    #[arg(default_value = "default")]
    device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SystemName {
    Pal,
    Ntsc,
}

struct TransferParams {
    system: DvSystem,
    rate: SampleRate,
    /// Hardware period size in sample frames
    period: usize,
    /// Samples to keep buffered ahead of the mixer
    delay_frames: usize,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // Usage errors exit 2; --help exits 0. Both are clap's defaults.
    let args = Args::parse();
    let settings = MixerSettings::load();

    let (host, port) = match (args.host.or(settings.host), args.port.or(settings.port)) {
        (Some(host), Some(port)) => (host, port),
        _ => {
            tracing::error!(
                "mixer hostname and port are not defined; pass -h/-p or set MIXER_HOST/MIXER_PORT"
            );
            process::exit(2);
        }
    };
    let port: u16 = match port.parse() {
        Ok(port) => port,
        Err(_) => {
            tracing::error!(port = %port, "invalid mixer port");
            process::exit(2);
        }
    };
    let Some(rate) = SampleRate::from_hz(args.rate) else {
        tracing::error!(rate = args.rate, "unsupported sample rate for DV audio");
        process::exit(2);
    };
    if !args.delay.is_finite() || args.delay < 0.0 {
        tracing::error!(delay = args.delay, "delay must be non-negative");
        process::exit(2);
    }

    let params = TransferParams {
        system: match args.system {
            SystemName::Pal => DvSystem::System625_50,
            SystemName::Ntsc => DvSystem::System525_60,
        },
        rate,
        period: 0, // negotiated below
        delay_frames: (args.delay * f64::from(rate.hz())) as usize,
    };

    if let Err(e) = run(&args.device, &host, port, params) {
        tracing::error!(error = ?e, "fatal error");
        process::exit(1);
    }
}

fn run(device: &str, host: &str, port: u16, mut params: TransferParams) -> Result<()> {
    tracing::info!(device, "Capturing");
    let pcm = PCM::new(device, Direction::Capture, false)
        .with_context(|| format!("opening PCM device {device}"))?;
    params.period = negotiate_hw_params(&pcm, &params).context("configuring PCM device")?;

    tracing::info!(host, port, "Connecting to mixer");
    let mut socket =
        TcpStream::connect((host, port)).with_context(|| format!("connecting to {host}:{port}"))?;
    socket.write_all(&GREETING_SOURCE).context("sending greeting")?;
    tracing::info!("Connected");

    transfer_frames(&pcm, &mut socket, &params)
}

fn negotiate_hw_params(pcm: &PCM, params: &TransferParams) -> Result<usize> {
    let hwp = HwParams::any(pcm)?;
    hwp.set_access(Access::RWInterleaved)?;
    hwp.set_format(Format::s16())?;
    hwp.set_channels(AUDIO_CHANNELS as u32)?;
    hwp.set_rate_resample(true)?;
    hwp.set_rate(params.rate.hz(), ValueOr::Nearest)?;
    // One hardware period per schedule entry keeps wakeups on the frame
    // cadence.
    let first_count = params.system.audio_cycle(params.rate)[0];
    let period = hwp.set_period_size_near(i64::from(first_count), ValueOr::Nearest)?;
    hwp.set_buffer_time_near(250_000, ValueOr::Nearest)?;
    pcm.hw_params(&hwp)?;
    Ok(period as usize)
}

fn transfer_frames(pcm: &PCM, socket: &mut TcpStream, params: &TransferParams) -> Result<()> {
    let io = pcm.io_i16().context("mapping PCM for interleaved reads")?;
    let cycle = params.system.audio_cycle(params.rate);

    // Room for the configured delay (at least 2000 frames) plus a
    // hardware period that may complete just past the threshold.
    let buffer_frames = params.delay_frames.max(2000) + params.period - 1;
    let mut samples = vec![0i16; AUDIO_CHANNELS * buffer_frames];
    let mut avail = 0usize;
    let mut serial = 0usize;

    let mut frame = vec![0u8; DIF_MAX_FRAME_SIZE];
    dif::fill_dummy(&mut frame, params.system);

    loop {
        let frame_count = usize::from(cycle[serial % cycle.len()]);

        while avail < params.delay_frames || avail < frame_count {
            let window = &mut samples[AUDIO_CHANNELS * avail..AUDIO_CHANNELS * (avail + params.period)];
            match io.readi(window) {
                Ok(read) => avail += read,
                Err(e) if e.errno() == libc::EPIPE => {
                    // Capture overrun: the device dropped samples while
                    // we were away. Re-prime and keep going.
                    pcm.prepare().context("recovering from capture overrun")?;
                    tracing::warn!("Failing to keep up with the audio source");
                }
                Err(e) => return Err(e).context("reading from PCM device"),
            }
        }

        dif::set_audio(
            &mut frame,
            params.system,
            params.rate,
            &samples[..AUDIO_CHANNELS * frame_count],
        );
        socket
            .write_all(&frame[..params.system.frame_size()])
            .context("writing frame to mixer")?;

        samples.copy_within(AUDIO_CHANNELS * frame_count..AUDIO_CHANNELS * avail, 0);
        avail -= frame_count;
        serial = serial.wrapping_add(1);
    }
}
