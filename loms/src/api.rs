//! Transport-agnostic RPC facade.
//!
//! Request and response types mirror the public wire contract: integers are
//! 64 bits wide and are narrowed explicitly before they reach the domain.
//! Every failure leaves the facade as a [`Status`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::{ErrorKind, LomsError};
use crate::lifecycle::OrderLifecycleService;
use crate::order::Item;
use crate::reservation::StockReservationEngine;
use crate::store::{OrderRepository, StockRepository};
use crate::types::{count_from_wire, order_from_wire, sku_from_wire, user_from_wire, widen_u32};

/// Message returned for every internal failure.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

/// Status codes the facade can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    /// Request is valid but the system state forbids it.
    FailedPrecondition,
    /// Target entity missing or not in a usable state.
    NotFound,
    /// Request is malformed.
    InvalidArgument,
    /// Unexpected failure; details are only logged.
    Internal,
}

/// Failed call outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Classification.
    pub code: Code,
    /// Human-readable description.
    pub message: String,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

impl From<LomsError> for Status {
    fn from(error: LomsError) -> Self {
        let code = match error.kind() {
            ErrorKind::InsufficientStock => Code::FailedPrecondition,
            ErrorKind::NotFound | ErrorKind::InvalidOrderState => Code::NotFound,
            ErrorKind::NegativeCount | ErrorKind::InvalidInput => Code::InvalidArgument,
            ErrorKind::Internal => {
                error!(error = %error, "[api.internal_error] request failed");
                return Self {
                    code: Code::Internal,
                    message: INTERNAL_ERROR_MESSAGE.to_owned(),
                };
            }
        };
        Self {
            code,
            message: error.to_string(),
        }
    }
}

/// Order line on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireItem {
    /// SKU.
    pub sku: u64,
    /// Units.
    pub count: u64,
}

/// `order_create` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreateRequest {
    /// Customer id.
    pub user: i64,
    /// Order lines.
    pub items: Vec<WireItem>,
}

/// `order_create` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreateResponse {
    /// Allocated order id.
    pub order_id: i64,
}

/// `order_pay` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPayRequest {
    /// Order to pay.
    pub order_id: i64,
}

/// `order_cancel` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelRequest {
    /// Order to cancel.
    pub order_id: i64,
}

/// `order_info` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfoRequest {
    /// Order to describe.
    pub order_id: i64,
}

/// `order_info` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderInfoResponse {
    /// Customer id.
    pub user: i64,
    /// Lifecycle state name.
    pub status: String,
    /// Order lines.
    pub items: Vec<WireItem>,
}

/// `stocks_info` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StocksInfoRequest {
    /// SKU to query.
    pub sku: u64,
}

/// `stocks_info` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StocksInfoResponse {
    /// Units available for reservation.
    pub count: u64,
}

/// The service's public operations.
#[derive(Debug)]
pub struct LomsApi<O, S> {
    orders: OrderLifecycleService<O, S>,
    stocks: StockReservationEngine<S>,
}

impl<O, S> Clone for LomsApi<O, S> {
    fn clone(&self) -> Self {
        Self {
            orders: self.orders.clone(),
            stocks: self.stocks.clone(),
        }
    }
}

impl<O: OrderRepository, S: StockRepository> LomsApi<O, S> {
    /// Builds the facade over the two services.
    pub const fn new(orders: OrderLifecycleService<O, S>, stocks: StockReservationEngine<S>) -> Self {
        Self { orders, stocks }
    }

    /// Creates an order and reserves its stock.
    pub async fn order_create(
        &self,
        request: OrderCreateRequest,
    ) -> Result<OrderCreateResponse, Status> {
        let user = user_from_wire(request.user)?;
        let items = request
            .items
            .iter()
            .map(|item| Ok(Item::new(sku_from_wire(item.sku)?, count_from_wire(item.count)?)))
            .collect::<Result<Vec<_>, LomsError>>()?;

        let order_id = self.orders.create(user, items).await?;
        Ok(OrderCreateResponse {
            order_id: order_id.into_inner(),
        })
    }

    /// Pays an order awaiting payment.
    pub async fn order_pay(&self, request: OrderPayRequest) -> Result<(), Status> {
        let order_id = order_from_wire(request.order_id)?;
        self.orders.pay(order_id).await?;
        Ok(())
    }

    /// Cancels an order awaiting payment.
    pub async fn order_cancel(&self, request: OrderCancelRequest) -> Result<(), Status> {
        let order_id = order_from_wire(request.order_id)?;
        self.orders.cancel(order_id).await?;
        Ok(())
    }

    /// Describes an order.
    pub async fn order_info(&self, request: OrderInfoRequest) -> Result<OrderInfoResponse, Status> {
        let order_id = order_from_wire(request.order_id)?;
        let order = self.orders.get_by_id(order_id).await?;
        Ok(OrderInfoResponse {
            user: order.user_id.into_inner(),
            status: order.state.to_string(),
            items: order
                .items
                .iter()
                .map(|item| WireItem {
                    sku: widen_u32(item.sku.into_inner()),
                    count: widen_u32(item.count.into_inner()),
                })
                .collect(),
        })
    }

    /// Units of a SKU available for reservation.
    pub async fn stocks_info(&self, request: StocksInfoRequest) -> Result<StocksInfoResponse, Status> {
        let sku = sku_from_wire(request.sku)?;
        let available = self.stocks.available(sku).await?;
        Ok(StocksInfoResponse {
            count: widen_u32(available),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{Operation, StorageError};
    use crate::order::OrderState;
    use crate::types::{OrderId, Sku};
    use tracing_test::traced_test;

    fn code_of(error: LomsError) -> Code {
        Status::from(error).code
    }

    #[test]
    fn domain_errors_map_to_their_codes() {
        let sku = Sku::new(1);
        let order_id = OrderId::try_new(1000).expect("positive");

        assert_eq!(
            code_of(LomsError::InsufficientStock { sku, requested: 2, available: 1 }),
            Code::FailedPrecondition
        );
        assert_eq!(code_of(LomsError::OrderNotFound(order_id)), Code::NotFound);
        assert_eq!(code_of(LomsError::StockNotFound(sku)), Code::NotFound);
        assert_eq!(
            code_of(LomsError::InvalidOrderState {
                order_id,
                from: OrderState::Payed,
                to: OrderState::Cancelled
            }),
            Code::NotFound
        );
        assert_eq!(
            code_of(LomsError::NegativeReserved { sku, reserved: 0, requested: 1 }),
            Code::InvalidArgument
        );
        assert_eq!(
            code_of(LomsError::NegativeAvailable { sku, total: 0, reserved: 1 }),
            Code::InvalidArgument
        );
        assert_eq!(code_of(LomsError::InvalidInput("bad".to_owned())), Code::InvalidArgument);
    }

    #[traced_test]
    #[test]
    fn internal_errors_hide_their_details() {
        let status = Status::from(LomsError::from(StorageError::failure(
            Operation::InsertOrder,
            "connection reset by peer",
        )));

        assert_eq!(status.code, Code::Internal);
        assert_eq!(status.message, INTERNAL_ERROR_MESSAGE);
        assert!(logs_contain("connection reset by peer"));
    }

    #[test]
    fn status_serializes_with_screaming_code() {
        let status = Status {
            code: Code::FailedPrecondition,
            message: "insufficient stock".to_owned(),
        };
        insta::assert_json_snapshot!(status, @r###"
        {
          "code": "FAILED_PRECONDITION",
          "message": "insufficient stock"
        }
        "###);
    }
}
