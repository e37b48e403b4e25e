pub mod auth;

use crate::p2p::messages::{HeadInfo, HeaderSummary, RangeQuery, SubmitReply};
use crate::{BlockOrigin, NodeHandle};
use auth::{Forbidden, Role, require};
use cancelchain_core::{AcceptOutcome, Block, ChainError, Transaction};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use warp::Filter;
use warp::http::StatusCode;
use warp::reply::{Reply, Response, with_status};

/// Largest range served by `/blocks` and `/headers` in one request.
pub const MAX_RANGE: u64 = 500;
const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct BlockQuery {
    pub hash: String,
}

#[derive(Debug, Deserialize)]
pub struct SubjectQuery {
    pub subject: String,
    /// When given, the reply also carries this address's unforgiven
    /// opposition to the subject.
    pub address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MiningToggle {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct TipInfo {
    pub height: u64,
    pub hash: String,
    pub work: String,
}

fn json_reply<T: Serialize>(body: &T, status: StatusCode) -> Response {
    with_status(warp::reply::json(body), status).into_response()
}

fn ok<T: Serialize>(body: &T) -> Result<Response, warp::Rejection> {
    Ok(json_reply(body, StatusCode::OK))
}

fn not_found(what: &str) -> Result<Response, warp::Rejection> {
    Ok(json_reply(
        &serde_json::json!({ "status": "error", "message": format!("{} not found", what) }),
        StatusCode::NOT_FOUND,
    ))
}

fn error_status(err: &ChainError) -> StatusCode {
    match err {
        ChainError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ChainError::Linkage(_) => StatusCode::CONFLICT,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn chain_error(err: ChainError) -> Result<Response, warp::Rejection> {
    if err.is_fatal() {
        log::error!("[ERROR] storage failure while serving request: {}", err);
    }
    Ok(json_reply(
        &serde_json::json!({
            "status": "error",
            "kind": err.kind(),
            "message": err.to_string(),
        }),
        error_status(&err),
    ))
}

fn submitted(status: &str) -> Result<Response, warp::Rejection> {
    ok(&SubmitReply {
        status: status.to_string(),
        message: None,
    })
}

pub async fn get_head(node: NodeHandle) -> Result<Response, warp::Rejection> {
    let head = HeadInfo::from(node.chain.read().head());
    ok(&head)
}

pub async fn get_block(q: BlockQuery, node: NodeHandle) -> Result<Response, warp::Rejection> {
    let found = node.chain.read().load_block(&q.hash);
    match found {
        Ok(Some(block)) => ok(&block),
        Ok(None) => not_found("block"),
        Err(e) => chain_error(e),
    }
}

pub async fn get_blocks(q: RangeQuery, node: NodeHandle) -> Result<Response, warp::Rejection> {
    let blocks = node
        .chain
        .read()
        .blocks_range(q.from_height, q.count.min(MAX_RANGE));
    match blocks {
        Ok(blocks) => ok(&blocks),
        Err(e) => chain_error(e),
    }
}

pub async fn get_headers(q: RangeQuery, node: NodeHandle) -> Result<Response, warp::Rejection> {
    let metas = node
        .chain
        .read()
        .headers_range(q.from_height, q.count.min(MAX_RANGE));
    match metas {
        Ok(metas) => ok(&metas.iter().map(HeaderSummary::from).collect::<Vec<_>>()),
        Err(e) => chain_error(e),
    }
}

pub async fn get_tips(node: NodeHandle) -> Result<Response, warp::Rejection> {
    let tips = node.chain.read().branch_tips();
    match tips {
        Ok(tips) => ok(&tips
            .iter()
            .map(|m| TipInfo {
                height: m.height,
                hash: m.hash.clone(),
                work: format!("0x{:x}", m.work()),
            })
            .collect::<Vec<_>>()),
        Err(e) => chain_error(e),
    }
}

pub async fn get_transaction(txid: String, node: NodeHandle) -> Result<Response, warp::Rejection> {
    let confirmed = node.chain.read().load_tx(&txid);
    match confirmed {
        Ok(Some(tx)) => ok(&serde_json::json!({ "transaction": tx, "confirmed": true })),
        Ok(None) => match node.mempool.lock().get(&txid).cloned() {
            Some(tx) => ok(&serde_json::json!({ "transaction": tx, "confirmed": false })),
            None => not_found("transaction"),
        },
        Err(e) => chain_error(e),
    }
}

pub async fn get_balance(address: String, node: NodeHandle) -> Result<Response, warp::Rejection> {
    let balance = node.chain.read().balance(&address);
    match balance {
        Ok(balance) => ok(&serde_json::json!({ "address": address, "balance": balance })),
        Err(e) => chain_error(e),
    }
}

pub async fn get_utxos(address: String, node: NodeHandle) -> Result<Response, warp::Rejection> {
    let utxos = node.chain.read().utxos_for(&address);
    match utxos {
        Ok(utxos) => ok(&utxos),
        Err(e) => chain_error(e),
    }
}

pub async fn get_subject(q: SubjectQuery, node: NodeHandle) -> Result<Response, warp::Rejection> {
    let summary = {
        let chain = node.chain.read();
        chain.subject_summary(&q.subject).and_then(|summary| {
            let unforgiven = match &q.address {
                Some(address) => Some(chain.unforgiven(address, &q.subject)?),
                None => None,
            };
            Ok((summary, unforgiven))
        })
    };
    match summary {
        Ok((summary, None)) => ok(&summary),
        Ok((summary, Some(unforgiven))) => ok(&serde_json::json!({
            "subject": summary.subject,
            "opposed": summary.opposed,
            "forgiven": summary.forgiven,
            "supported": summary.supported,
            "address": q.address,
            "unforgiven": unforgiven,
        })),
        Err(e) => chain_error(e),
    }
}

pub async fn get_pending(node: NodeHandle) -> Result<Response, warp::Rejection> {
    let pending = node.mempool.lock().snapshot();
    ok(&pending)
}

pub async fn get_status(node: NodeHandle) -> Result<Response, warp::Rejection> {
    let head = HeadInfo::from(node.chain.read().head());
    let pending = node.mempool.lock().len();
    let hashrate = node
        .mining
        .current_hashrate
        .lock()
        .map(|h| *h)
        .unwrap_or(0.0);
    ok(&serde_json::json!({
        "height": head.height,
        "hash": head.hash,
        "pending": pending,
        "peers": node.peers.get_peer_heights(),
        "mining": {
            "enabled": node.mining.enabled.load(Ordering::SeqCst),
            "active": node.mining.active.load(Ordering::SeqCst),
            "hashrate": hashrate,
            "blocks_mined": node.mining.blocks_mined.load(Ordering::SeqCst),
        },
        "uptime_secs": node.node_start_time.elapsed().as_secs(),
    }))
}

pub async fn post_block(block: Block, node: NodeHandle) -> Result<Response, warp::Rejection> {
    // Validation hashes every transaction; keep it off the reactor.
    let result =
        tokio::task::spawn_blocking(move || node.submit_block(&block, BlockOrigin::Api)).await;
    match result {
        Ok(Ok(AcceptOutcome::AlreadyKnown)) => submitted("known"),
        Ok(Ok(AcceptOutcome::Extended)) => submitted("accepted"),
        Ok(Ok(AcceptOutcome::Reorganized { .. })) => submitted("reorganized"),
        Ok(Ok(AcceptOutcome::SideBranch)) => submitted("side_branch"),
        Ok(Err(e)) => chain_error(e),
        Err(e) => {
            log::error!("[ERROR] block validation task failed: {}", e);
            Ok(json_reply(
                &serde_json::json!({ "status": "error", "message": "internal error" }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

pub async fn post_transaction(tx: Transaction, node: NodeHandle) -> Result<Response, warp::Rejection> {
    match node.submit_transaction(&tx) {
        Ok(true) => submitted("accepted"),
        Ok(false) => submitted("known"),
        Err(e) => chain_error(e),
    }
}

pub async fn post_mining(toggle: MiningToggle, node: NodeHandle) -> Result<Response, warp::Rejection> {
    node.mining.enabled.store(toggle.enabled, Ordering::SeqCst);
    if !toggle.enabled {
        node.mining.cancel_flag.store(true, Ordering::SeqCst);
    }
    log::info!(
        "⛏️  Mining {} via admin API",
        if toggle.enabled { "enabled" } else { "disabled" }
    );
    ok(&serde_json::json!({ "enabled": toggle.enabled }))
}

async fn handle_rejection(err: warp::Rejection) -> Result<Response, warp::Rejection> {
    if let Some(forbidden) = err.find::<Forbidden>() {
        return Ok(json_reply(
            &serde_json::json!({
                "status": "error",
                "message": format!("{:?} role required", forbidden.required),
            }),
            StatusCode::FORBIDDEN,
        ));
    }
    if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        return Ok(json_reply(
            &serde_json::json!({ "status": "error", "message": e.to_string() }),
            StatusCode::BAD_REQUEST,
        ));
    }
    Err(err)
}

/// Every route of the peer API, access log and role gate included.
pub fn routes(
    node: NodeHandle,
) -> impl Filter<Extract = (impl Reply,), Error = warp::Rejection> + Clone {
    let node_filter = {
        let node = node.clone();
        warp::any().map(move || node.clone())
    };
    let roles = node.roles.clone();

    // -------------------------------
    // read side, open to every role
    let head = warp::path!("head")
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(get_head);

    let block = warp::path!("block")
        .and(warp::get())
        .and(warp::query::<BlockQuery>())
        .and(node_filter.clone())
        .and_then(get_block);

    let blocks = warp::path!("blocks")
        .and(warp::get())
        .and(warp::query::<RangeQuery>())
        .and(node_filter.clone())
        .and_then(get_blocks);

    let headers = warp::path!("headers")
        .and(warp::get())
        .and(warp::query::<RangeQuery>())
        .and(node_filter.clone())
        .and_then(get_headers);

    let tips = warp::path!("tips")
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(get_tips);

    let transaction = warp::path!("transaction" / String)
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(get_transaction);

    let balance = warp::path!("address" / String / "balance")
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(get_balance);

    let utxos = warp::path!("address" / String / "utxos")
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(get_utxos);

    let subject = warp::path!("subject")
        .and(warp::get())
        .and(warp::query::<SubjectQuery>())
        .and(node_filter.clone())
        .and_then(get_subject);

    let pending = warp::path!("pending")
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(get_pending);

    let status = warp::path!("status")
        .and(warp::get())
        .and(node_filter.clone())
        .and_then(get_status);

    // -------------------------------
    // write side, gated by role
    let submit_block = warp::path!("block")
        .and(warp::post())
        .and(require(roles.clone(), Role::Miller))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<Block>())
        .and(node_filter.clone())
        .and_then(post_block);

    let submit_tx = warp::path!("transaction")
        .and(warp::post())
        .and(require(roles.clone(), Role::Transactor))
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::json::<Transaction>())
        .and(node_filter.clone())
        .and_then(post_transaction);

    let mining = warp::path!("admin" / "mining")
        .and(warp::post())
        .and(require(roles, Role::Admin))
        .and(warp::body::json::<MiningToggle>())
        .and(node_filter)
        .and_then(post_mining);

    head.or(block)
        .unify()
        .or(blocks)
        .unify()
        .or(headers)
        .unify()
        .or(tips)
        .unify()
        .or(transaction)
        .unify()
        .or(balance)
        .unify()
        .or(utxos)
        .unify()
        .or(subject)
        .unify()
        .or(pending)
        .unify()
        .or(status)
        .unify()
        .or(submit_block)
        .unify()
        .or(submit_tx)
        .unify()
        .or(mining)
        .unify()
        .recover(handle_rejection)
        .unify()
        .with(warp::log("cancelchain::http"))
}

pub async fn run_server(node: NodeHandle, addr: SocketAddr) {
    log::info!("🌐 HTTP API listening on http://{}", addr);
    warp::serve(routes(node)).run(addr).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{next_block, test_node};
    use cancelchain_core::transaction::builder;
    use cancelchain_core::wallet::Wallet;
    use chrono::Utc;

    #[tokio::test]
    async fn reads_and_missing_lookups() {
        let node = test_node();
        let miner = Wallet::generate();
        for _ in 0..3 {
            let block = next_block(&node.chain.read(), &miner, &[]);
            node.submit_block(&block, BlockOrigin::Sync).unwrap();
        }

        assert_eq!(get_head(node.clone()).await.unwrap().status(), StatusCode::OK);
        let range = RangeQuery {
            from_height: 1,
            count: 10_000,
        };
        assert_eq!(
            get_headers(range, node.clone()).await.unwrap().status(),
            StatusCode::OK
        );
        assert_eq!(get_tips(node.clone()).await.unwrap().status(), StatusCode::OK);

        let head_hash = node.chain.read().head().hash.clone();
        let found = get_block(BlockQuery { hash: head_hash }, node.clone())
            .await
            .unwrap();
        assert_eq!(found.status(), StatusCode::OK);

        let missing = get_block(
            BlockQuery {
                hash: "ef".repeat(32),
            },
            node.clone(),
        )
        .await
        .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let missing = get_transaction("ef".repeat(32), node.clone()).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn submit_paths_map_errors_to_status() {
        let node = test_node();
        let miner = Wallet::generate();
        let block = next_block(&node.chain.read(), &miner, &[]);

        let reply = post_block(block.clone(), node.clone()).await.unwrap();
        assert_eq!(reply.status(), StatusCode::OK);
        assert_eq!(node.chain.read().head().hash, block.block_hash);

        let again = post_block(block.clone(), node.clone()).await.unwrap();
        assert_eq!(again.status(), StatusCode::OK);

        let mut orphan = next_block(&node.chain.read(), &miner, &[]);
        orphan.header.prev_hash = "ab".repeat(32);
        let reply = post_block(orphan, node.clone()).await.unwrap();
        assert_eq!(reply.status(), StatusCode::CONFLICT);

        let mut tampered = next_block(&node.chain.read(), &miner, &[]);
        tampered.header.proof_of_work += 1;
        let reply = post_block(tampered, node.clone()).await.unwrap();
        assert_eq!(reply.status(), StatusCode::BAD_REQUEST);
        assert_eq!(node.chain.read().head().height, 1);
    }

    #[tokio::test]
    async fn transaction_submit_and_lookup() {
        let node = test_node();
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let block = next_block(&node.chain.read(), &alice, &[]);
        node.submit_block(&block, BlockOrigin::Sync).unwrap();

        let tx = {
            let chain = node.chain.read();
            let utxos = chain.utxos_for(alice.address()).unwrap();
            builder::transfer(&alice, &utxos, bob.address(), 10, Utc::now().timestamp()).unwrap()
        };
        let reply = post_transaction(tx.clone(), node.clone()).await.unwrap();
        assert_eq!(reply.status(), StatusCode::OK);
        assert!(node.mempool.lock().contains(&tx.txid));

        let pending = get_transaction(tx.txid.clone(), node.clone()).await.unwrap();
        assert_eq!(pending.status(), StatusCode::OK);
        let confirmed = get_transaction(block.txns[0].txid.clone(), node.clone())
            .await
            .unwrap();
        assert_eq!(confirmed.status(), StatusCode::OK);

        // Same inflows, different payee: a pending double spend.
        let conflicting = {
            let chain = node.chain.read();
            let utxos = chain.utxos_for(alice.address()).unwrap();
            builder::transfer(&alice, &utxos, alice.address(), 10, Utc::now().timestamp())
                .unwrap()
        };
        let reply = post_transaction(conflicting, node.clone()).await.unwrap();
        assert_eq!(reply.status(), StatusCode::BAD_REQUEST);
        assert_eq!(node.mempool.lock().len(), 1);
    }

    #[tokio::test]
    async fn admin_toggle_stops_miner() {
        let node = test_node();
        post_mining(MiningToggle { enabled: true }, node.clone())
            .await
            .unwrap();
        assert!(node.mining.enabled.load(Ordering::SeqCst));

        post_mining(MiningToggle { enabled: false }, node.clone())
            .await
            .unwrap();
        assert!(!node.mining.enabled.load(Ordering::SeqCst));
        assert!(node.mining.cancel_flag.load(Ordering::SeqCst));
    }
}
