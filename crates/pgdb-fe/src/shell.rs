//! Front-end shell: resolves one line of user input into an overlay
//! message (or a purely local action) per spec.md §6's verb list.

use std::collections::HashMap;

use tokio::net::tcp::OwnedWriteHalf;
use tracing::warn;

use pgdb_core::coordinator::frontend::{self, Frontend};
use pgdb_core::transport::framing::write_frame;
use pgdb_core::transport::{FrameConfig, Message, NodeId, RankTarget};

async fn send(w: &mut OwnedWriteHalf, msg: &Message, cfg: &FrameConfig) -> std::io::Result<()> {
    for (tag, bytes) in pgdb_core::transport::framing::encode_message(msg, cfg)? {
        write_frame(w, tag, &bytes).await?;
    }
    Ok(())
}

pub async fn broadcast(writers: &mut HashMap<NodeId, OwnedWriteHalf>, msg: &Message, cfg: &FrameConfig) {
    for (node, w) in writers.iter_mut() {
        if let Err(e) = send(w, msg, cfg).await {
            warn!(%node, "send failed: {e}");
        }
    }
}

pub fn split_rest(text: &str) -> Vec<String> {
    text.split_whitespace().skip(1).map(str::to_string).collect()
}

/// Resolves and dispatches one line of shell input. Returns `false` on `quit`.
pub async fn handle_input_line(
    line: &str,
    token: u64,
    fe: &mut Frontend,
    writers: &mut HashMap<NodeId, OwnedWriteHalf>,
    cfg: &FrameConfig,
) -> bool {
    let (target, text) = match fe.resolve_target(line) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("pgdb: {e}");
            return true;
        }
    };
    if text.is_empty() {
        return true;
    }
    let msg = match text.split_once(' ').map(|(v, _)| v).unwrap_or(text) {
        "quit" => {
            broadcast(writers, &Message::Quit, cfg).await;
            return false;
        }
        "kill" => Message::Kill,
        "filter" => Message::Filter { subtypes: split_rest(text) },
        "unfilter" => Message::Unfilter { subtypes: split_rest(text) },
        "block" => {
            match split_rest(text).first().map(String::as_str).map(|s| frontend::parse_rank_spec(s, fe.world_size)) {
                Some(Ok(ranks)) => fe.block(&ranks),
                Some(Err(e)) => eprintln!("pgdb: {e}"),
                None => eprintln!("pgdb: block requires a rank spec"),
            }
            return true;
        }
        "unblock" => {
            match split_rest(text).first().map(String::as_str).map(|s| frontend::parse_rank_spec(s, fe.world_size)) {
                Some(Ok(ranks)) => fe.unblock(&ranks),
                Some(Err(e)) => eprintln!("pgdb: {e}"),
                None => eprintln!("pgdb: unblock requires a rank spec"),
            }
            return true;
        }
        "varprint" => match split_rest(text).into_iter().next() {
            Some(name) => Message::Varprint { target, token, name },
            None => {
                eprintln!("pgdb: varprint requires a dotted variable name");
                return true;
            }
        },
        "expand" => {
            let n = split_rest(text).first().and_then(|s| s.parse::<usize>().ok()).unwrap_or(fe.history.len().saturating_sub(1));
            if let Some(entry) = fe.history.get(n) {
                for printed in frontend::expand_classes(&entry.batch) {
                    println!("[{}] {}", printed.ranks, printed.text);
                }
            } else {
                eprintln!("pgdb: no history entry {n}");
            }
            return true;
        }
        _ => Message::Command { target: RankTarget::Ranks(target), token, text: text.to_string() },
    };
    broadcast(writers, &msg, cfg).await;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_rest_drops_the_verb() {
        assert_eq!(split_rest("filter breakpoint-hit stopped"), vec!["breakpoint-hit", "stopped"]);
    }
}
