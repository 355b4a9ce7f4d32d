use chrono::prelude::*;
use ledger_agreement::blockchain::{replay_queued_blocks, SyncStateRecorder};
use ledger_agreement::config::NodeConfig;
use ledger_agreement::eventstore::{EventJournal, MemoryJournal, SqliteJournal};
use ledger_agreement::logger::init_logger;
use ledger_agreement::node::{spawn_gc, ConsensusNode, LocalNetwork, LocalTransport};
use ledger_agreement::{Block, BlockPool, BlockPoolModel, ConsensusCoordinator, SenderId};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const ROUNDS: u64 = 3;

struct Member {
    node: Arc<ConsensusNode<LocalTransport>>,
    pool: Arc<BlockPoolModel>,
}

fn open_journal(config: &NodeConfig, member: usize) -> Result<Arc<dyn EventJournal>, Box<dyn Error>> {
    let journal: Arc<dyn EventJournal> = match &config.journal_path {
        Some(path) => Arc::new(SqliteJournal::open(&format!("{}.{}", path, member))?),
        None => Arc::new(MemoryJournal::new()),
    };
    Ok(journal)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = NodeConfig::from_env()?;
    init_logger(config.log_format);

    info!(
        cluster_size = config.cluster_size,
        quorum = config.quorum(),
        "Starting in-process agreement cluster"
    );

    let network = LocalNetwork::new();
    let mut confirmations = network.subscribe_confirmations();
    let mut members = Vec::new();
    let mut journals = Vec::new();

    for i in 0..config.cluster_size {
        let id = SenderId::new(format!("{}-{}", config.node_id, i));
        let journal = open_journal(&config, i)?;
        let pool = Arc::new(BlockPoolModel::new(journal.clone()));
        let coordinator = Arc::new(ConsensusCoordinator::new(
            id.clone(),
            config.quorum(),
            config.gc_grace,
            pool.clone(),
        ));
        spawn_gc(
            coordinator.clone(),
            config.gc_grace.max(Duration::from_millis(100)),
            config.round_timeout,
        );

        let (transport, mut inbox) = network.join(id);
        let node = Arc::new(ConsensusNode::new(coordinator, transport));
        let receiver = node.clone();
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                if let Err(e) = receiver.handle_inbound(&envelope.payload).await {
                    warn!(error = %e, from = %envelope.from, "Inbound message failed");
                }
            }
        });

        members.push(Member { node, pool });
        journals.push(journal);
    }

    // Member 0 catches up before taking part, so its sync flag is exercised.
    let sync = SyncStateRecorder::restore(journals[0].clone())?;
    sync.begin(ROUNDS)?;

    let mut previous_hash = String::from("0000_genesis_hash");
    for height in 1..=ROUNDS {
        let block = Block::new(
            height,
            previous_hash.clone(),
            format!("transfer-batch-{}", height).into_bytes(),
            Utc::now().timestamp(),
        );
        let proposer = &members[(height as usize) % members.len()];
        proposer.node.propose(block.clone()).await?;

        let mut confirmed = 0;
        while confirmed < members.len() {
            match tokio::time::timeout(Duration::from_secs(5), confirmations.recv()).await {
                Ok(Ok(_)) => confirmed += 1,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    error!(height, confirmed, "Timed out waiting for confirmations");
                    break;
                }
            }
        }
        info!(height, confirmed, hash = %block.hash(), "Block agreed");

        // Hand-off to block storage happens here; the pool entry is no longer needed.
        for member in &members {
            member.pool.delete(height);
        }
        previous_hash = block.hash().to_string();
    }

    sync.finish(ROUNDS)?;

    for (i, journal) in journals.iter().enumerate() {
        let queued = replay_queued_blocks(journal.as_ref())?;
        info!(member = i, queued = queued.len(), staged = members[i].pool.len(), "Audit trail");
    }
    ledger_agreement::log_with_context!(info, "Cluster run completed");

    Ok(())
}
