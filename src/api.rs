use std::net::SocketAddr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::chain::{ChainHandle, ModuleOptions, NodeStatus};
use crate::errors::{ChainError, ChainResult};
use crate::forger::ForgingStatus;
use crate::pool::PoolQuery;
use crate::types::{Block, CommonBlock, SanitizedTransaction, Transaction};

#[derive(Clone)]
struct AppState {
    chain: ChainHandle,
}

#[derive(Serialize)]
struct ErrorResponse {
    name: &'static str,
    error: String,
}

#[derive(Serialize)]
struct ValueResponse {
    value: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    success: bool,
    transaction_id: String,
}

#[derive(Serialize)]
struct TransactionsResponse {
    success: bool,
    transactions: Vec<Transaction>,
}

#[derive(Serialize)]
struct BlocksResponse {
    success: bool,
    blocks: Vec<Block>,
}

#[derive(Serialize)]
struct CommonResponse {
    success: bool,
    common: Option<CommonBlock>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    height: u64,
}

#[derive(Deserialize)]
struct ForgingRequest {
    public_key: String,
    password: String,
    forging: bool,
}

#[derive(Deserialize)]
struct LastBlockIdQuery {
    last_block_id: String,
}

#[derive(Deserialize)]
struct CommonQuery {
    ids: String,
}

#[derive(Deserialize)]
struct SlotQuery {
    epoch_time: Option<u64>,
}

#[derive(Deserialize)]
struct PoolQueryParams {
    #[serde(rename = "type")]
    tx_type: Option<u8>,
    sender_id: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct AddressTransactionsQuery {
    from_timestamp: Option<u64>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct HeightRangeQuery {
    from_height: u64,
    to_height: u64,
    limit: Option<usize>,
}

pub async fn serve(chain: ChainHandle, addr: SocketAddr) -> ChainResult<()> {
    let state = AppState { chain };
    let router = Router::new()
        .route("/health", get(health))
        .route("/status/node", get(node_status))
        .route("/supply/:height", get(supply))
        .route("/milestone/:height", get(milestone))
        .route("/reward/:height", get(reward))
        .route("/delegates/list/:round", get(delegate_list))
        .route("/delegates/forging", get(forging_status).post(update_forging))
        .route("/transactions", get(shared_transactions).post(submit_transaction))
        .route("/transactions/pool", get(pooled_transactions))
        .route("/blocks", get(blocks_after))
        .route("/blocks/common", get(blocks_common))
        .route("/blocks/latest", get(last_block))
        .route("/blocks/max-height", get(max_height))
        .route("/blocks/range", get(blocks_between))
        .route("/blocks/height/:height", get(block_at_height))
        .route("/blocks/timestamp/:timestamp", get(block_at_timestamp))
        .route("/slots/number", get(slot_number))
        .route("/slots/round/:height", get(slot_round))
        .route("/wallets/:address/multisig/members", get(multisig_members))
        .route("/wallets/:address/multisig/min", get(multisig_min))
        .route(
            "/wallets/:address/transactions/inbound",
            get(inbound_transactions),
        )
        .route(
            "/wallets/:address/transactions/outbound",
            get(outbound_transactions),
        )
        .route(
            "/wallets/:address/blocks/:block_id/inbound",
            get(inbound_from_block),
        )
        .route(
            "/wallets/:address/blocks/:block_id/outbound",
            get(outbound_from_block),
        )
        .route("/options", get(module_options))
        .with_state(state);

    let listener = TcpListener::bind(addr).await?;
    info!(?addr, "chain API listening");
    axum::serve(listener, router)
        .await
        .map_err(|err| ChainError::Io(std::io::Error::other(err)))
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        height: state.chain.get_node_status().height,
    })
}

async fn node_status(State(state): State<AppState>) -> Json<NodeStatus> {
    Json(state.chain.get_node_status())
}

async fn supply(State(state): State<AppState>, Path(height): Path<u64>) -> Json<ValueResponse> {
    Json(ValueResponse {
        value: state.chain.calculate_supply(height),
    })
}

async fn milestone(State(state): State<AppState>, Path(height): Path<u64>) -> Json<u64> {
    Json(state.chain.calculate_milestone(height))
}

async fn reward(State(state): State<AppState>, Path(height): Path<u64>) -> Json<ValueResponse> {
    Json(ValueResponse {
        value: state.chain.calculate_reward(height),
    })
}

async fn delegate_list(
    State(state): State<AppState>,
    Path(round): Path<u64>,
) -> ApiResult<Vec<String>> {
    state
        .chain
        .generate_delegate_list(round, None)
        .map(Json)
        .map_err(to_http_error)
}

async fn forging_status(State(state): State<AppState>) -> Json<Vec<ForgingStatus>> {
    Json(state.chain.forging_status_for_all_delegates())
}

async fn update_forging(
    State(state): State<AppState>,
    Json(request): Json<ForgingRequest>,
) -> ApiResult<ForgingStatus> {
    state
        .chain
        .update_forging_status(&request.public_key, &request.password, request.forging)
        .map(Json)
        .map_err(to_http_error)
}

async fn shared_transactions(State(state): State<AppState>) -> Json<TransactionsResponse> {
    Json(TransactionsResponse {
        success: true,
        transactions: state.chain.get_transactions(),
    })
}

async fn pooled_transactions(
    State(state): State<AppState>,
    Query(params): Query<PoolQueryParams>,
) -> Json<Vec<Transaction>> {
    let query = PoolQuery {
        tx_type: params.tx_type,
        sender_id: params.sender_id,
        limit: params.limit,
    };
    Json(state.chain.get_transactions_from_pool(&query))
}

async fn submit_transaction(
    State(state): State<AppState>,
    Json(transaction): Json<Transaction>,
) -> ApiResult<SubmitResponse> {
    match state.chain.post_transaction(transaction).await {
        Ok(transaction_id) => Ok(Json(SubmitResponse {
            success: true,
            transaction_id,
        })),
        Err(err) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                name: "InvalidTransactionError",
                error: err.to_string(),
            }),
        )),
    }
}

async fn blocks_after(
    State(state): State<AppState>,
    Query(query): Query<LastBlockIdQuery>,
) -> ApiResult<BlocksResponse> {
    state
        .chain
        .blocks(&query.last_block_id)
        .map(|blocks| {
            Json(BlocksResponse {
                success: true,
                blocks,
            })
        })
        .map_err(to_http_error)
}

async fn blocks_common(
    State(state): State<AppState>,
    Query(query): Query<CommonQuery>,
) -> ApiResult<CommonResponse> {
    state
        .chain
        .blocks_common("api", &query.ids)
        .map(|common| {
            Json(CommonResponse {
                success: true,
                common,
            })
        })
        .map_err(to_http_error)
}

async fn last_block(State(state): State<AppState>) -> Json<Block> {
    Json(state.chain.get_last_block())
}

async fn max_height(State(state): State<AppState>) -> ApiResult<u64> {
    state.chain.get_max_block_height().map(Json).map_err(to_http_error)
}

async fn blocks_between(
    State(state): State<AppState>,
    Query(query): Query<HeightRangeQuery>,
) -> ApiResult<Vec<Block>> {
    state
        .chain
        .get_blocks_between_heights(query.from_height, query.to_height, query.limit.unwrap_or(100))
        .map(Json)
        .map_err(to_http_error)
}

async fn block_at_height(
    State(state): State<AppState>,
    Path(height): Path<u64>,
) -> ApiResult<Option<Block>> {
    state
        .chain
        .get_block_at_height(height)
        .map(Json)
        .map_err(to_http_error)
}

async fn block_at_timestamp(
    State(state): State<AppState>,
    Path(timestamp): Path<u64>,
) -> ApiResult<Option<Block>> {
    state
        .chain
        .get_last_block_at_timestamp(timestamp)
        .map(Json)
        .map_err(to_http_error)
}

async fn slot_number(
    State(state): State<AppState>,
    Query(query): Query<SlotQuery>,
) -> Json<u64> {
    Json(state.chain.get_slot_number(query.epoch_time))
}

async fn slot_round(State(state): State<AppState>, Path(height): Path<u64>) -> Json<u64> {
    Json(state.chain.calc_slot_round(height))
}

async fn multisig_members(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<Vec<String>> {
    state
        .chain
        .get_multisig_wallet_members(&address)
        .map(Json)
        .map_err(to_http_error)
}

async fn multisig_min(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> ApiResult<u32> {
    state
        .chain
        .get_min_multisig_required_signatures(&address)
        .map(Json)
        .map_err(to_http_error)
}

async fn inbound_transactions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<AddressTransactionsQuery>,
) -> ApiResult<Vec<SanitizedTransaction>> {
    state
        .chain
        .get_inbound_transactions(&address, query.from_timestamp, query.limit)
        .map(Json)
        .map_err(to_http_error)
}

async fn outbound_transactions(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(query): Query<AddressTransactionsQuery>,
) -> ApiResult<Vec<SanitizedTransaction>> {
    state
        .chain
        .get_outbound_transactions(&address, query.from_timestamp, query.limit)
        .map(Json)
        .map_err(to_http_error)
}

async fn inbound_from_block(
    State(state): State<AppState>,
    Path((address, block_id)): Path<(String, String)>,
) -> ApiResult<Vec<SanitizedTransaction>> {
    state
        .chain
        .get_inbound_transactions_from_block(&address, &block_id)
        .map(Json)
        .map_err(to_http_error)
}

async fn outbound_from_block(
    State(state): State<AppState>,
    Path((address, block_id)): Path<(String, String)>,
) -> ApiResult<Vec<SanitizedTransaction>> {
    state
        .chain
        .get_outbound_transactions_from_block(&address, &block_id)
        .map(Json)
        .map_err(to_http_error)
}

async fn module_options(State(state): State<AppState>) -> Json<ModuleOptions> {
    Json(state.chain.get_module_options())
}

fn to_http_error(err: ChainError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, name) = match &err {
        ChainError::Validation(_) => (StatusCode::BAD_REQUEST, "ValidationError"),
        ChainError::Config(_) => (StatusCode::BAD_REQUEST, "ConfigError"),
        ChainError::State(_) => (StatusCode::NOT_FOUND, "StateError"),
        ChainError::Consensus(_) => (StatusCode::CONFLICT, "ConsensusError"),
        ChainError::Pool(_) => (StatusCode::CONFLICT, "PoolError"),
        ChainError::Network(_) => (StatusCode::SERVICE_UNAVAILABLE, "NetworkError"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    };
    (
        status,
        Json(ErrorResponse {
            name,
            error: err.to_string(),
        }),
    )
}
