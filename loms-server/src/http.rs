//! JSON gateway over [`LomsApi`].
//!
//! Every route is a `POST` taking the request type as its body. Failures are
//! returned as `{"code": ..., "message": ...}` with the HTTP status matching
//! the facade code.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use loms::api::{
    OrderCancelRequest, OrderCreateRequest, OrderCreateResponse, OrderInfoRequest,
    OrderInfoResponse, OrderPayRequest, StocksInfoRequest, StocksInfoResponse,
};
use loms::{Code, LomsApi, OrderRepository, Status, StockRepository};
use serde_json::json;

/// A facade failure on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Status);

impl From<Status> for ApiError {
    fn from(status: Status) -> Self {
        Self(status)
    }
}

/// HTTP status for a facade code.
pub const fn http_status(code: Code) -> StatusCode {
    match code {
        Code::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::InvalidArgument => StatusCode::BAD_REQUEST,
        Code::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({ "code": self.0.code, "message": self.0.message });
        (http_status(self.0.code), Json(body)).into_response()
    }
}

/// Routes for every facade operation.
pub fn router<O, S>(api: LomsApi<O, S>) -> Router
where
    O: OrderRepository + 'static,
    S: StockRepository + 'static,
{
    Router::new()
        .route("/v1/order/create", post(order_create::<O, S>))
        .route("/v1/order/pay", post(order_pay::<O, S>))
        .route("/v1/order/cancel", post(order_cancel::<O, S>))
        .route("/v1/order/info", post(order_info::<O, S>))
        .route("/v1/stock/info", post(stocks_info::<O, S>))
        .with_state(api)
}

async fn order_create<O: OrderRepository, S: StockRepository>(
    State(api): State<LomsApi<O, S>>,
    Json(request): Json<OrderCreateRequest>,
) -> Result<Json<OrderCreateResponse>, ApiError> {
    Ok(Json(api.order_create(request).await?))
}

async fn order_pay<O: OrderRepository, S: StockRepository>(
    State(api): State<LomsApi<O, S>>,
    Json(request): Json<OrderPayRequest>,
) -> Result<StatusCode, ApiError> {
    api.order_pay(request).await?;
    Ok(StatusCode::OK)
}

async fn order_cancel<O: OrderRepository, S: StockRepository>(
    State(api): State<LomsApi<O, S>>,
    Json(request): Json<OrderCancelRequest>,
) -> Result<StatusCode, ApiError> {
    api.order_cancel(request).await?;
    Ok(StatusCode::OK)
}

async fn order_info<O: OrderRepository, S: StockRepository>(
    State(api): State<LomsApi<O, S>>,
    Json(request): Json<OrderInfoRequest>,
) -> Result<Json<OrderInfoResponse>, ApiError> {
    Ok(Json(api.order_info(request).await?))
}

async fn stocks_info<O: OrderRepository, S: StockRepository>(
    State(api): State<LomsApi<O, S>>,
    Json(request): Json<StocksInfoRequest>,
) -> Result<Json<StocksInfoResponse>, ApiError> {
    Ok(Json(api.stocks_info(request).await?))
}
