//! ndi-bridge command line harness.
//!
//! Three modes:
//! - `discover`: list NDI sources on this network and exit
//! - `host`:     capture an NDI source, encode, stream over UDP
//! - `join`:     receive a UDP stream, decode, publish as NDI
//!
//! Exit code 0 on clean shutdown, 1 on startup failure.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use log::{error, info};

use ndi_bridge::ndi::{CaptureConfig, NdiCapture};
use ndi_bridge::{HostConfig, HostPipeline, JoinConfig, JoinPipeline};

#[derive(Parser)]
#[command(
    name = "ndi-bridge",
    version,
    about = "NDI over WAN: capture, H.264 over UDP, republish"
)]
struct Cli {
    /// Enable debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Discover NDI sources on the network.
    Discover {
        /// How long to scan, in milliseconds.
        #[arg(long, default_value_t = 5000)]
        timeout: u32,
    },
    /// Capture an NDI source and stream it over UDP.
    Host(HostArgs),
    /// Receive a UDP stream and output it as an NDI source.
    Join(JoinArgs),
}

#[derive(Args)]
struct HostArgs {
    /// NDI source name to capture (substring match).
    #[arg(long)]
    source: Option<String>,

    /// Auto-select the first available source.
    #[arg(long)]
    auto: bool,

    /// Target address as host:port.
    #[arg(long, default_value = "127.0.0.1:5990")]
    target: String,

    /// Video bitrate in Mbps.
    #[arg(long, default_value_t = 8)]
    bitrate: u32,

    /// UDP datagram size budget; use 1200 on VPN tunnels.
    #[arg(long, default_value_t = 1400)]
    mtu: usize,

    /// Microseconds to sleep between fragments of one frame.
    #[arg(long, default_value_t = 0)]
    pacing: u64,
}

#[derive(Args)]
struct JoinArgs {
    /// NDI output source name.
    #[arg(long, default_value = "NDI Bridge")]
    name: String,

    /// UDP listen port.
    #[arg(long, default_value_t = 5990)]
    port: u16,

    /// Playback buffer delay in milliseconds (0 = real-time).
    #[arg(long, default_value_t = 0)]
    buffer: u32,

    /// UDP datagram size budget; must match the host side.
    #[arg(long, default_value_t = 1400)]
    mtu: usize,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if cli.verbose { "debug" } else { "info" }),
    )
    .init();

    // Signal handling: one shared flag drives every pipeline loop.
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
        }) {
            error!("failed to install signal handler: {}", e);
        }
    }

    match cli.mode {
        Mode::Discover { timeout } => run_discover(timeout),
        Mode::Host(args) => run_host(args, &running),
        Mode::Join(args) => run_join(args, &running),
    }
}

fn run_discover(timeout: u32) -> ExitCode {
    let capture = NdiCapture::new(CaptureConfig {
        discovery_timeout_ms: timeout,
        ..CaptureConfig::default()
    });
    match capture.discover_sources() {
        Ok(sources) if sources.is_empty() => {
            println!("No NDI sources found.");
            ExitCode::SUCCESS
        }
        Ok(sources) => {
            println!("Found {} NDI source(s):", sources.len());
            for (i, source) in sources.iter().enumerate() {
                if source.address.is_empty() {
                    println!("  [{}] {}", i + 1, source.name);
                } else {
                    println!("  [{}] {} ({})", i + 1, source.name, source.address);
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("discovery failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_host(args: HostArgs, running: &AtomicBool) -> ExitCode {
    let Some((host, port)) = parse_target(&args.target) else {
        error!("invalid --target '{}', expected host:port", args.target);
        return ExitCode::FAILURE;
    };
    if !mtu_is_sane(args.mtu) {
        return ExitCode::FAILURE;
    }

    let mut pipeline = HostPipeline::new(HostConfig {
        source_name: args.source,
        auto_select: args.auto,
        target_host: host,
        target_port: port,
        bitrate_mbps: args.bitrate,
        mtu: args.mtu,
        pacing_delay_us: args.pacing,
        ..HostConfig::default()
    });

    if let Err(e) = pipeline.start() {
        error!("failed to start host mode: {}", e);
        return ExitCode::FAILURE;
    }

    info!("press Ctrl+C to stop");
    pipeline.run(running);
    ExitCode::SUCCESS
}

fn run_join(args: JoinArgs, running: &AtomicBool) -> ExitCode {
    if !mtu_is_sane(args.mtu) {
        return ExitCode::FAILURE;
    }
    let mut pipeline = JoinPipeline::new(JoinConfig {
        listen_port: args.port,
        output_name: args.name,
        mtu: args.mtu,
        buffer_ms: args.buffer,
    });

    if let Err(e) = pipeline.start() {
        error!("failed to start join mode: {}", e);
        return ExitCode::FAILURE;
    }

    info!("press Ctrl+C to stop");
    pipeline.run(running);
    ExitCode::SUCCESS
}

/// Both endpoints must agree on the MTU; reject sizes that leave no
/// room for payload or exceed a single UDP datagram.
fn mtu_is_sane(mtu: usize) -> bool {
    if (256..=65_507).contains(&mtu) {
        true
    } else {
        error!("--mtu {} out of range (256-65507)", mtu);
        false
    }
}

/// Split `host:port`, keeping IPv6 literals intact.
fn parse_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    Some((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("192.168.1.10:5990"),
            Some(("192.168.1.10".to_string(), 5990))
        );
        assert_eq!(
            parse_target("bridge.example.com:6000"),
            Some(("bridge.example.com".to_string(), 6000))
        );
        assert_eq!(
            parse_target("[::1]:5990"),
            Some(("::1".to_string(), 5990))
        );
        assert_eq!(parse_target("no-port"), None);
        assert_eq!(parse_target(":5990"), None);
        assert_eq!(parse_target("host:notaport"), None);
    }
}
