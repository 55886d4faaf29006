//! pgdb-be — the back-end binary: attaches one `gdb --interpreter=mi2`
//! process to a target, drives the back-end state machine, and forwards
//! aggregated output upward over the overlay (spec.md §4.5, §5).

use tikv_jemallocator::Jemalloc;
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

fn release_memory_to_os() {
    // SAFETY: calling jemalloc's mallctl with valid, null-output arguments
    // to purge all arenas; this never touches live allocations.
    unsafe {
        tikv_jemalloc_sys::mallctl(c"arena.4096.purge".as_ptr().cast(), std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut(), 0);
    }
}

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pgdb_core::config::CoreConfig;
use pgdb_core::coordinator::backend::Backend;
use pgdb_core::transport::framing::{read_frame, write_frame};
use pgdb_core::transport::message::Message;
use pgdb_core::transport::sbd::{Direction, LoadFilePolicy, SbdRegion};
use pgdb_core::transport::{FrameConfig, Reassembler};
use pgdb_core::util::init_logging;

mod gdb;
use gdb::Gdb;

/// Back-end process: attaches GDB to one target and relays its output.
#[derive(Parser)]
#[command(name = "pgdb-be", about = "Back-end process for the pgdb parallel debugger", version)]
struct Args {
    /// This process's rank within the job.
    #[arg(long)]
    rank: i64,

    /// Address of the parent overlay node (relay or front-end) to connect to.
    #[arg(long)]
    parent_addr: String,

    /// GDB binary to spawn, resolved via PATH.
    #[arg(long, default_value = "gdb")]
    gdb: String,

    /// Program to debug.
    #[arg(long)]
    program: PathBuf,

    /// Arguments passed to the debugged program.
    #[arg(long, num_args = 0.., trailing_var_arg = true)]
    program_args: Vec<String>,

    /// Known executables and glob patterns a load-file SBD request may name.
    #[arg(long)]
    known_executable: Vec<String>,
    #[arg(long)]
    allowed_pattern: Vec<String>,

    /// Enables the SBD side-channel, identified by a shared-memory region name.
    #[arg(long)]
    sbd_id: Option<String>,

    #[command(flatten)]
    core: CoreConfig,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, &["pgdb_be", "pgdb_core"]);

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args));
    std::process::exit(exit_code);
}

async fn async_main(args: Args) -> i32 {
    let (mut gdb, mut gdb_rx) = match Gdb::spawn(&args.gdb, &args.program, &args.program_args) {
        Ok(g) => g,
        Err(e) => {
            error!("failed to spawn gdb: {e}");
            return 1;
        }
    };

    let stream = match TcpStream::connect(&args.parent_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to connect to parent {}: {e}", args.parent_addr);
            return 1;
        }
    };
    let (parent_read, mut parent_write) = stream.into_split();

    let (parent_tx, mut parent_rx) = mpsc::channel::<Vec<u8>>(256);
    spawn_parent_reader(parent_read, parent_tx);

    let frame_cfg = args.core.frame_config();
    let policy = LoadFilePolicy { known_executables: args.known_executable.clone(), allowed_patterns: args.allowed_pattern.clone() };

    let sbd = match &args.sbd_id {
        Some(id) => match SbdRegion::open(id) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!("could not open SBD region '{id}': {e}");
                None
            }
        },
        None => None,
    };

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrlc = running.clone();
    if let Err(e) = ctrlc::set_handler(move || running_ctrlc.store(false, Ordering::SeqCst)) {
        warn!("failed to install Ctrl-C handler: {e}");
    }

    let mut backend = Backend::new(args.rank);
    backend.limits = args.core.varprint_limits();
    for cmd in gdb::startup_commands() {
        if let Err(e) = gdb.send(cmd).await {
            error!("failed to write startup command: {e}");
            return 1;
        }
    }

    let mut reassembler = Reassembler::new();
    let mut pending_varprint_tokens: HashMap<String, (u64, i64)> = HashMap::new();
    let mut sbd_poll = tokio::time::interval(Duration::from_millis(20));
    let grace = Duration::from_secs(args.core.backend_grace_period_secs);
    let mut silence = tokio::time::interval(Duration::from_secs(1));
    let mut seconds_since_parent = 0u64;

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            Some(line) = gdb_rx.recv() => {
                let step = backend.ingest_line(&line);
                if !step.out_batch.is_empty() {
                    let _ = send_parent(&mut parent_write, &Message::Out { batch: step.out_batch }, &frame_cfg).await;
                }
                if let Some((target_name, result)) = step.varprint_result {
                    if let Some((token, rank)) = pending_varprint_tokens.remove(&target_name) {
                        let _ = send_parent(&mut parent_write, &Message::VarprintResult { token, rank, result }, &frame_cfg).await;
                    }
                }
                if let Some((token, text)) = step.pending_command {
                    let _ = gdb.send(&format!("{token}{text}")).await;
                }
            }
            Some(bytes) = parent_rx.recv() => {
                seconds_since_parent = 0;
                match reassembler.feed(bytes) {
                    Ok(Some(msg)) => {
                        if !handle_parent_message(
                            msg, args.rank, &mut backend, &mut gdb, &mut parent_write,
                            &frame_cfg, &policy, sbd.as_ref(), &mut pending_varprint_tokens,
                        ).await {
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("frame reassembly error: {e}"),
                }
            }
            _ = sbd_poll.tick(), if sbd.is_some() => {
                if let Some(region) = &sbd {
                    match region.poll() {
                        Ok((Direction::Request, payload)) => {
                            let path = String::from_utf8_lossy(&payload).trim_end_matches('\0').to_string();
                            if policy.allows(&path) {
                                let _ = send_parent(&mut parent_write, &Message::LoadFile { path }, &frame_cfg).await;
                            } else {
                                let _ = region.publish_error(Direction::Response);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => warn!("sbd poll error: {e}"),
                    }
                }
            }
            _ = silence.tick() => {
                seconds_since_parent += 1;
                if seconds_since_parent >= grace.as_secs() {
                    warn!("parent stream silent for {}s, self-terminating", seconds_since_parent);
                    running.store(false, Ordering::SeqCst);
                }
            }
            else => break,
        }
    }

    let _ = gdb.child.kill().await;
    release_memory_to_os();
    0
}

async fn send_parent(w: &mut OwnedWriteHalf, msg: &Message, cfg: &FrameConfig) -> std::io::Result<()> {
    for (tag, bytes) in pgdb_core::transport::framing::encode_message(msg, cfg)? {
        write_frame(w, tag, &bytes).await?;
    }
    Ok(())
}

fn spawn_parent_reader(mut read_half: tokio::net::tcp::OwnedReadHalf, tx: mpsc::Sender<Vec<u8>>) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(bytes) => {
                    if tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("parent connection closed: {e}");
                    break;
                }
            }
        }
    });
}

#[allow(clippy::too_many_arguments)]
async fn handle_parent_message(
    msg: Message,
    rank: i64,
    backend: &mut Backend,
    gdb: &mut Gdb,
    parent_write: &mut OwnedWriteHalf,
    frame_cfg: &FrameConfig,
    policy: &LoadFilePolicy,
    sbd: Option<&SbdRegion>,
    pending_varprint_tokens: &mut HashMap<String, (u64, i64)>,
) -> bool {
    let _ = policy;
    match msg {
        Message::Hello => true,
        Message::Command { target, token, text } => {
            if target.includes(rank) {
                let _ = gdb.send(&format!("{token}{text}")).await;
            }
            true
        }
        Message::Varprint { target, token, name } => {
            if target.includes(rank) {
                let (internal_token, text) = backend.varprint_request(&name);
                pending_varprint_tokens.insert(name, (token, rank));
                let _ = gdb.send(&format!("{internal_token}{text}")).await;
            }
            true
        }
        Message::Filter { subtypes } => {
            backend.filters.add(subtypes);
            true
        }
        Message::Unfilter { subtypes } => {
            backend.filters.remove(&subtypes);
            true
        }
        Message::Kill => {
            let _ = gdb.send("-interpreter-exec console \"kill\"").await;
            true
        }
        Message::Quit => {
            let _ = gdb.send("-gdb-exit").await;
            false
        }
        Message::Die => false,
        Message::FileData { path, data, error } => {
            if let Some(region) = sbd {
                let payload = if error { pgdb_core::transport::sbd::ERROR_SENTINEL.as_bytes().to_vec() } else { data };
                let _ = region.publish(Direction::Response, &payload);
            }
            let _ = path;
            true
        }
        other => {
            info!(kind = other.kind_name(), "back-end ignoring unexpected message kind");
            true
        }
    }
}
