use anyhow::Context;
use bytes::Bytes;
use coherent_grid::cluster::local::LocalNetwork;
use coherent_grid::cluster::types::{NodeId, NodeRole};
use coherent_grid::config::GridConfig;
use coherent_grid::grid::node::GridNode;
use coherent_grid::grid::registry::{InvokeOutcome, InvokeRegistry};
use coherent_grid::message::types::LineFunction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    owner: String,
    balance: i64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = GridConfig::from_env().context("invalid GRID_* configuration")?;
    tracing::info!("Configuration: {}", serde_json::to_string(&config)?);

    // 1. Line functions, registered on every node:
    let functions = InvokeRegistry::new();
    functions.register("incr", |data, args| {
        let current = data
            .map(|d| String::from_utf8_lossy(d).parse::<i64>())
            .transpose()?
            .unwrap_or(0);
        let step = String::from_utf8_lossy(args).parse::<i64>()?;
        let next = (current + step).to_string();
        Ok(InvokeOutcome {
            update: Some(Bytes::from(next.clone())),
            result: Some(Bytes::from(next)),
        })
    });

    // 2. Three masters, node 1 with a standby slave:
    let network = LocalNetwork::new();
    let mut nodes = Vec::new();
    for id in 1..=3 {
        nodes.push(GridNode::local(
            &network,
            NodeId(id),
            NodeRole::Master,
            config.clone(),
            functions.clone(),
        ));
    }
    let standby = GridNode::local(
        &network,
        NodeId(1),
        NodeRole::Slave,
        config.clone(),
        functions.clone(),
    );

    for node in nodes.iter().chain(std::iter::once(&standby)) {
        node.clone().start().await;
    }

    // 3. Message pump for the in-process transport:
    let pump = network.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(1));
        loop {
            interval.tick().await;
            pump.deliver_all();
        }
    });

    let (a, b, c) = (nodes[0].store(), nodes[1].store(), nodes[2].store());

    // 4. Lines moving between nodes:
    let id = a.put("hello", None).await?.id().context("PUT returned no id")?;
    tracing::info!("Node 1 allocated line {:#x}", id);

    let read = c.get_from_owner(id, a.me()).await?.into_data();
    tracing::info!("Node 3 read {:?}", read);

    tokio::time::sleep(config.backup_interval() * 5).await;
    b.set(id, "world", None).await?;
    tracing::info!("Node 2 took ownership and wrote line {:#x}", id);

    let read = c.get(id).await?.into_data();
    tracing::info!("Node 3 now reads {:?}", read);

    // 5. Work shipped to the owner:
    let counter = a.put("0", None).await?.id().context("PUT returned no id")?;
    for _ in 0..3 {
        let value = c
            .invoke(counter, LineFunction::new("incr", "5"), None)
            .await?
            .into_data();
        tracing::info!("incr on line {:#x} -> {:?}", counter, value);
    }

    // 6. Typed values and transactions:
    let account = a.put(Bytes::new(), None).await?.id().context("PUT returned no id")?;
    let txn = a.begin_transaction();
    a.set_as(
        account,
        &Account {
            owner: "ada".to_string(),
            balance: 100,
        },
        Some(&txn),
    )
    .await?;
    a.commit(&txn)?;
    let loaded: Option<Account> = b.get_as(account).await?;
    tracing::info!("Node 2 loaded {:?}", loaded);

    for node in &nodes {
        tracing::info!("Stats: {}", serde_json::to_string(&node.store().stats())?);
    }

    // 7. Fail node 1 over to its standby:
    tokio::time::sleep(config.backup_interval() * 10).await;
    network.kill(NodeId(1));
    tracing::info!("Node 1 is now served by its former slave ({:?})", standby.role());

    let read = standby.store().get(counter).await?.into_data();
    tracing::info!("Promoted node reads counter {:?}", read);

    Ok(())
}
