//
// main.rs - xdpdump, a per-queue AF_XDP packet dump
//
// Purpose:
//   Command-line front end for the xdp-capture engine. Binds one receive
//   stream per hardware queue, drives each from its own thread, and stops
//   on Ctrl-C or after the configured duration, printing per-queue packet
//   counts on the way out.
//

use anyhow::Context as _;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use xdp_capture::{CaptureConfig, RX_BATCH_SIZE, Received, RxStream, XdpCapture};

#[derive(Parser, Debug)]
#[command(arg_required_else_help = true)]
struct Args {
    /// capture device, "xdp:IFNAME" or a bare interface name
    device: String,

    /// worker threads, one hardware queue each
    #[clap(short, long, default_value_t = 1)]
    threads: usize,

    /// stop after this long, like 10s or 2m (default: run until Ctrl-C)
    #[clap(short, long)]
    duration: Option<String>,

    /// print one line per packet instead of counters only
    #[clap(short, long)]
    print: bool,

    /// require zero-copy mode (default: copy mode)
    #[clap(short, long)]
    zero_copy: bool,

    /// let the kernel pick the bind mode instead of forcing copy
    #[clap(long, conflicts_with = "zero_copy")]
    auto_mode: bool,

    /// back the packet memory with huge pages
    #[clap(long)]
    huge_pages: bool,

    /// bind with the need-wakeup protocol
    #[clap(long)]
    need_wakeup: bool,

    /// attach the XDP program in generic (SKB) mode
    #[clap(long)]
    skb_mode: bool,

    /// attach the XDP program in native driver mode
    #[clap(long, conflicts_with = "skb_mode")]
    drv_mode: bool,

    /// BPF object file with a redirect program and its xsks_map
    #[clap(long)]
    bpf_obj: Option<std::path::PathBuf>,

    /// program name inside the BPF object (default: the first one)
    #[clap(long, requires = "bpf_obj")]
    bpf_prog: Option<String>,

    /// more logging, repeatable
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

fn run_worker(mut stream: RxStream, print: bool) -> (u32, u64, u64) {
    let queue = stream.queue();
    let mut packets: u64 = 0;
    let mut bytes: u64 = 0;
    loop {
        match stream.read_batch(RX_BATCH_SIZE) {
            Ok(Received::Batch(batch)) => {
                for p in &batch {
                    packets += 1;
                    bytes += p.wire_len() as u64;
                    if print {
                        println!(
                            "{} queue {queue} len {}",
                            humantime::format_rfc3339_nanos(p.time()),
                            p.wire_len()
                        );
                    }
                }
            }
            Ok(Received::Halted) => break,
            Err(e) => {
                log::error!("queue {queue}: {e}");
                break;
            }
        }
    }
    (queue, packets, bytes)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::builder().filter_level(level).init();

    let duration = args
        .duration
        .as_deref()
        .map(humantime::parse_duration)
        .transpose()
        .context("invalid --duration")?;

    let config = CaptureConfig {
        zero_copy: match (args.zero_copy, args.auto_mode) {
            (true, _) => Some(true),
            (_, true) => None,
            _ => Some(false),
        },
        huge_page: args.huge_pages.then_some(true),
        need_wakeup: args.need_wakeup.then_some(true),
        xdp_flags: if args.skb_mode {
            xdp_capture::XDP_FLAGS_SKB_MODE
        } else if args.drv_mode {
            xdp_capture::XDP_FLAGS_DRV_MODE
        } else {
            0
        },
        bpf_object: args.bpf_obj,
        bpf_program: args.bpf_prog,
        ..CaptureConfig::default()
    };

    let mut capture = XdpCapture::new(&args.device, config)?;
    if args.threads > 1 {
        capture.start_parallel(args.threads)?;
    } else {
        capture.start()?;
    }

    let handler: extern "C" fn(libc::c_int) = on_sigint;
    unsafe {
        libc::signal(libc::SIGINT, handler as usize);
        libc::signal(libc::SIGTERM, handler as usize);
    }

    let mut workers = Vec::new();
    for index in 0..capture.stream_count() {
        if let Some(stream) = capture.take_stream(index) {
            let print = args.print;
            workers.push(thread::spawn(move || run_worker(stream, print)));
        }
    }
    log::info!("{} worker(s) reading from {}", workers.len(), capture.device());

    let deadline = duration.map(|d| Instant::now() + d);
    loop {
        if STOP.load(Ordering::SeqCst) {
            log::info!("interrupted");
            break;
        }
        if let Some(t) = deadline {
            if Instant::now() >= t {
                break;
            }
        }
        thread::sleep(Duration::from_millis(100));
    }
    capture.cancel();

    let mut total_packets: u64 = 0;
    let mut total_bytes: u64 = 0;
    for worker in workers {
        match worker.join() {
            Ok((queue, packets, bytes)) => {
                log::info!("queue {queue}: {packets} packets, {bytes} bytes");
                total_packets += packets;
                total_bytes += bytes;
            }
            Err(_) => log::error!("worker thread panicked"),
        }
    }
    log::info!("total: {total_packets} packets, {total_bytes} bytes");
    capture.finish();
    Ok(())
}
