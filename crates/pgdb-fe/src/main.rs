//! pgdb-fe — the front-end shell: realizes the overlay topology, accepts
//! its direct children's connections, and runs the two cooperating loops
//! described in spec.md §5 (input and transport).

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

use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Notify, mpsc};
use tracing::{error, info, warn};

use pgdb_core::config::CoreConfig;
use pgdb_core::coordinator::frontend::{Frontend, FrontendPhase};
use pgdb_core::transport::sbd::LoadFileDeduper;
use pgdb_core::transport::{Message, MultiSourceReassembler, NodeId, Topology};
use pgdb_core::transport::framing::{read_frame, write_frame};
use pgdb_core::util::init_logging;

mod shell;
use shell::{broadcast, handle_input_line};

/// Front-end shell for the pgdb parallel debugger.
#[derive(Parser)]
#[command(name = "pgdb", about = "Front-end shell for the pgdb parallel debugger", version)]
struct Args {
    /// Attach to an already-running job launcher by pid.
    #[arg(long, short = 'p', conflicts_with = "launch_args")]
    pid: Option<u32>,

    /// Launch and attach: remainder of the command line is passed to the
    /// resource manager.
    #[arg(short = 'a', num_args = 0.., trailing_var_arg = true)]
    launch_args: Vec<String>,

    /// Resource manager launcher binary.
    #[arg(long, default_value = "srun")]
    launcher: String,

    /// Launcher host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Single-node deployment: no relay tier, back-ends dial the front-end directly.
    #[arg(long)]
    local: bool,

    /// Force the SBD side-channel on.
    #[arg(long)]
    sbd: bool,

    /// Text topology descriptor (`parent:0 => child1:0 child2:0 … ;` per line).
    #[arg(long)]
    topology_file: Option<PathBuf>,

    /// Back-end hosts, used to build a topology when `--topology-file` is absent.
    #[arg(long, value_delimiter = ',')]
    hosts: Vec<String>,

    /// Address this front-end listens on for its direct children.
    #[arg(long, default_value = "127.0.0.1:4040")]
    listen_addr: String,

    #[command(flatten)]
    core: CoreConfig,

    /// Increase logging verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode: errors only.
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, &["pgdb_fe", "pgdb_core"]);

    if args.pid.is_none() && args.launch_args.is_empty() {
        eprintln!("pgdb: exactly one of --pid or -a <args...> is required");
        std::process::exit(1);
    }

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args));
    std::process::exit(exit_code);
}

async fn async_main(args: Args) -> i32 {
    let topology = match realize_topology(&args) {
        Ok(t) => t,
        Err(e) => {
            error!("failed to realize topology: {e}");
            return 1;
        }
    };
    let world_size = args.core.ranks_per_backend * topology.leaves().len() as i64;
    info!(relays = topology.relay_count(), leaves = topology.leaves().len(), world_size, "topology realized");

    let listener = match TcpListener::bind(&args.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {e}", args.listen_addr);
            return 1;
        }
    };

    let direct_children = topology.children_of(&topology.root).to_vec();
    let mut writers: HashMap<NodeId, OwnedWriteHalf> = HashMap::new();
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<(NodeId, Vec<u8>)>(256);

    for expected in &direct_children {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%expected, %peer, "child connected");
                let (read_half, write_half) = stream.into_split();
                writers.insert(expected.clone(), write_half);
                spawn_reader(expected.clone(), read_half, inbound_tx.clone());
            }
            Err(e) => {
                error!("accept failed waiting for {expected}: {e}");
                return 1;
            }
        }
    }

    let admitted = Arc::new(Notify::new());
    let (input_tx, mut input_rx) = mpsc::channel::<String>(64);
    let running = Arc::new(AtomicBool::new(true));
    spawn_input_loop(input_tx, running.clone(), admitted.clone());

    let running_ctrlc = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        running_ctrlc.store(false, Ordering::SeqCst);
    }) {
        warn!("failed to install Ctrl-C handler: {e}");
    }

    let mut fe = Frontend::new(world_size, args.core.history_length);
    let frame_cfg = args.core.frame_config();
    let mut reassembler = MultiSourceReassembler::new();
    let mut next_token: u64 = 1;
    let mut load_file_deduper = LoadFileDeduper::new();

    // Startup: broadcast hello and wait for the configured join count.
    for (_, w) in writers.iter_mut() {
        let _ = send(w, &Message::Hello, &frame_cfg).await;
    }
    fe.phase = FrontendPhase::Running;
    admitted.notify_one();

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            Some(line) = input_rx.recv() => {
                next_token += 1;
                if !handle_input_line(&line, next_token, &mut fe, &mut writers, &frame_cfg).await {
                    running.store(false, Ordering::SeqCst);
                }
            }
            Some((source, bytes)) = inbound_rx.recv() => {
                match reassembler.feed(&source.to_string(), bytes) {
                    Ok(Some(Message::Out { batch })) => {
                        if let Some(line) = fe.on_batch(batch) {
                            println!("[{}] {}", line.ranks, line.text);
                        }
                    }
                    Ok(Some(Message::VarprintResult { rank, result, .. })) => match result {
                        Ok(varobj) => println!("[{rank}] {} = {}", varobj.name, varobj.value.as_deref().unwrap_or("<no value>")),
                        Err(e) => eprintln!("[{rank}] varprint error: {e}"),
                    },
                    Ok(Some(Message::LoadFile { path })) => {
                        if load_file_deduper.should_load(&path) {
                            let (data, error) = match std::fs::read(&path) {
                                Ok(bytes) => (bytes, false),
                                Err(e) => {
                                    warn!(%path, "failed to read sbd-requested file: {e}");
                                    (Vec::new(), true)
                                }
                            };
                            broadcast(&mut writers, &Message::FileData { path, data, error }, &frame_cfg).await;
                        }
                    }
                    Ok(Some(other)) => info!(kind = other.kind_name(), %source, "unhandled message from child"),
                    Ok(None) => {}
                    Err(e) => warn!(%source, "frame reassembly error: {e}"),
                }
            }
            else => break,
        }
    }

    info!("shutting down, broadcasting quit");
    for (_, w) in writers.iter_mut() {
        let _ = send(w, &Message::Quit, &frame_cfg).await;
    }
    release_memory_to_os();
    0
}

fn realize_topology(args: &Args) -> Result<Topology, Box<dyn std::error::Error>> {
    if let Some(path) = &args.topology_file {
        let text = std::fs::read_to_string(path)?;
        Ok(Topology::parse(&text)?)
    } else {
        Ok(Topology::build(args.host.clone(), &args.hosts, args.core.relay_branching_factor)?)
    }
}

fn spawn_reader(source: NodeId, mut read_half: tokio::net::tcp::OwnedReadHalf, tx: mpsc::Sender<(NodeId, Vec<u8>)>) {
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(bytes) => {
                    if tx.send((source.clone(), bytes)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(%source, "connection closed: {e}");
                    break;
                }
            }
        }
    });
}

fn spawn_input_loop(tx: mpsc::Sender<String>, running: Arc<AtomicBool>, admitted: Arc<Notify>) {
    tokio::spawn(async move {
        admitted.notified().await;
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        while running.load(Ordering::SeqCst) {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin read error: {e}");
                    break;
                }
            }
        }
    });
}

async fn send(w: &mut OwnedWriteHalf, msg: &Message, cfg: &pgdb_core::transport::FrameConfig) -> std::io::Result<()> {
    for (tag, bytes) in pgdb_core::transport::framing::encode_message(msg, cfg)? {
        write_frame(w, tag, &bytes).await?;
    }
    Ok(())
}

