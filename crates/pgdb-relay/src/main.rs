//! pgdb-relay — an internal overlay tree node: accepts its children's
//! connections, aggregates their `out` batches under a barrier, and passes
//! every other message kind through unmodified (spec.md §4.4).

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
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use pgdb_core::config::CoreConfig;
use pgdb_core::transport::framing::{read_frame, write_frame};
use pgdb_core::transport::message::Message;
use pgdb_core::transport::overlay::AggregationBarrier;
use pgdb_core::transport::topology::{NodeId, Topology};
use pgdb_core::transport::{FrameConfig, MultiSourceReassembler, Reassembler};
use pgdb_core::util::init_logging;

/// Internal overlay tree node: aggregates children's output toward the root.
#[derive(Parser)]
#[command(name = "pgdb-relay", about = "Overlay relay node for the pgdb parallel debugger", version)]
struct Args {
    /// This node's id as it appears in the topology descriptor (`host:idx`).
    #[arg(long)]
    node_id: String,

    /// Text topology descriptor, as built by the front-end.
    #[arg(long)]
    topology_file: PathBuf,

    /// Address this relay listens on for its children.
    #[arg(long, default_value = "0.0.0.0:4040")]
    listen_addr: String,

    /// Address of this relay's parent (another relay, or the front-end).
    #[arg(long)]
    parent_addr: String,

    #[command(flatten)]
    core: CoreConfig,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[arg(short, long)]
    quiet: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet, &["pgdb_relay", "pgdb_core"]);

    let exit_code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
        .block_on(async_main(args));
    std::process::exit(exit_code);
}

async fn async_main(args: Args) -> i32 {
    let text = match std::fs::read_to_string(&args.topology_file) {
        Ok(t) => t,
        Err(e) => {
            error!("failed to read topology file {:?}: {e}", args.topology_file);
            return 1;
        }
    };
    let topology = match Topology::parse(&text) {
        Ok(t) => t,
        Err(e) => {
            error!("invalid topology descriptor: {e}");
            return 1;
        }
    };
    let self_id = match args.node_id.split_once(':') {
        Some((host, idx)) => NodeId::new(host, idx.parse().unwrap_or(0)),
        None => NodeId::new(&args.node_id, 0),
    };
    let children = topology.children_of(&self_id).to_vec();
    if children.is_empty() {
        warn!("relay {self_id} has no declared children in the topology");
    }

    let listener = match TcpListener::bind(&args.listen_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind {}: {e}", args.listen_addr);
            return 1;
        }
    };

    let mut child_writers: HashMap<NodeId, OwnedWriteHalf> = HashMap::new();
    let (child_tx, mut child_rx) = mpsc::channel::<(NodeId, Vec<u8>)>(256);
    for expected in &children {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%expected, %peer, "child connected");
                let (read_half, write_half) = stream.into_split();
                child_writers.insert(expected.clone(), write_half);
                spawn_reader(expected.clone(), read_half, child_tx.clone());
            }
            Err(e) => {
                error!("accept failed waiting for {expected}: {e}");
                return 1;
            }
        }
    }

    let parent_stream = match tokio::net::TcpStream::connect(&args.parent_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!("failed to connect to parent {}: {e}", args.parent_addr);
            return 1;
        }
    };
    let (parent_read, mut parent_write) = parent_stream.into_split();
    let (parent_tx, mut parent_rx) = mpsc::channel::<Vec<u8>>(256);
    spawn_parent_reader(parent_read, parent_tx);

    let running = Arc::new(AtomicBool::new(true));
    let running_ctrlc = running.clone();
    if let Err(e) = ctrlc::set_handler(move || running_ctrlc.store(false, Ordering::SeqCst)) {
        warn!("failed to install Ctrl-C handler: {e}");
    }

    let frame_cfg = args.core.frame_config();
    let mut from_children = MultiSourceReassembler::new();
    let mut from_parent = Reassembler::new();
    let mut barrier = AggregationBarrier::new();
    let mut barrier_timer = tokio::time::interval(Duration::from_millis(args.core.relay_barrier_timeout_ms));

    while running.load(Ordering::SeqCst) {
        tokio::select! {
            Some((source, bytes)) = child_rx.recv() => {
                match from_children.feed(&source.to_string(), bytes) {
                    Ok(Some(Message::Out { batch })) => {
                        barrier.record(source, batch);
                        if barrier.complete(&children) {
                            let merged = barrier.flush();
                            if !merged.is_empty() {
                                let _ = send(&mut parent_write, &Message::Out { batch: merged }, &frame_cfg).await;
                            }
                        }
                    }
                    Ok(Some(other)) => {
                        let _ = send(&mut parent_write, &other, &frame_cfg).await;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%source, "frame reassembly error from child: {e}"),
                }
            }
            Some(bytes) = parent_rx.recv() => {
                match from_parent.feed(bytes) {
                    Ok(Some(Message::Die)) => {
                        broadcast_down(&mut child_writers, &Message::Die, &frame_cfg).await;
                        running.store(false, Ordering::SeqCst);
                    }
                    Ok(Some(Message::Quit)) => {
                        broadcast_down(&mut child_writers, &Message::Quit, &frame_cfg).await;
                        running.store(false, Ordering::SeqCst);
                    }
                    Ok(Some(msg)) => broadcast_down(&mut child_writers, &msg, &frame_cfg).await,
                    Ok(None) => {}
                    Err(e) => warn!("frame reassembly error from parent: {e}"),
                }
            }
            _ = barrier_timer.tick() => {
                if barrier.pending_children() > 0 {
                    let merged = barrier.flush();
                    if !merged.is_empty() {
                        let _ = send(&mut parent_write, &Message::Out { batch: merged }, &frame_cfg).await;
                    }
                }
            }
            else => break,
        }
    }

    release_memory_to_os();
    0
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
                    warn!(%source, "child connection closed: {e}");
                    break;
                }
            }
        }
    });
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

async fn send(w: &mut OwnedWriteHalf, msg: &Message, cfg: &FrameConfig) -> std::io::Result<()> {
    for (tag, bytes) in pgdb_core::transport::framing::encode_message(msg, cfg)? {
        write_frame(w, tag, &bytes).await?;
    }
    Ok(())
}

async fn broadcast_down(writers: &mut HashMap<NodeId, OwnedWriteHalf>, msg: &Message, cfg: &FrameConfig) {
    for (node, w) in writers.iter_mut() {
        if let Err(e) = send(w, msg, cfg).await {
            warn!(%node, "send to child failed: {e}");
        }
    }
}
