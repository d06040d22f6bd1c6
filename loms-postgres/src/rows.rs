//! Row types and their conversion into domain values.

use std::collections::HashMap;

use loms::{Item, ItemCount, Operation, Order, OrderId, OrderState, Sku, Stock, StorageError, UserId};
use sqlx::FromRow;

/// One joined `orders` x `order_items` row.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OrderRow {
    /// Order id.
    pub id: i64,
    /// Customer id.
    pub user_id: i64,
    /// State name.
    pub state: String,
    /// Line SKU.
    pub sku: i64,
    /// Line count.
    pub count: i64,
}

/// One `stock` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct StockRow {
    /// SKU.
    pub sku: i64,
    /// Units held.
    pub total_count: i64,
    /// Units reserved.
    pub reserved: i64,
}

fn narrow(operation: Operation, column: &str, value: i64) -> Result<u32, StorageError> {
    u32::try_from(value)
        .map_err(|_| StorageError::corrupt(operation, format!("{column} value {value} out of range")))
}

impl StockRow {
    /// Converts to a domain row.
    pub fn into_stock(self, operation: Operation) -> Result<Stock, StorageError> {
        Ok(Stock {
            sku: Sku::new(narrow(operation, "sku", self.sku)?),
            total_count: narrow(operation, "total_count", self.total_count)?,
            reserved_count: narrow(operation, "reserved", self.reserved)?,
        })
    }
}

/// Rebuilds orders from joined rows.
///
/// Rows for one order need not be adjacent. Orders come out in the order
/// their first row appeared and keep their lines in row order.
pub fn group_order_rows(rows: Vec<OrderRow>, operation: Operation) -> Result<Vec<Order>, StorageError> {
    let (orders, _) = rows.into_iter().try_fold(
        (Vec::<Order>::new(), HashMap::<i64, usize>::new()),
        |(mut orders, mut positions), row| {
            let item = Item::new(
                Sku::new(narrow(operation, "sku", row.sku)?),
                ItemCount::try_new(narrow(operation, "count", row.count)?)
                    .map_err(|error| StorageError::corrupt(operation, error.to_string()))?,
            );

            if let Some(position) = positions.get(&row.id) {
                orders[*position].items.push(item);
            } else {
                let order = Order {
                    id: OrderId::try_new(row.id)
                        .map_err(|error| StorageError::corrupt(operation, error.to_string()))?,
                    user_id: UserId::try_new(row.user_id)
                        .map_err(|error| StorageError::corrupt(operation, error.to_string()))?,
                    state: row
                        .state
                        .parse::<OrderState>()
                        .map_err(|error| StorageError::corrupt(operation, error.to_string()))?,
                    items: vec![item],
                };
                positions.insert(row.id, orders.len());
                orders.push(order);
            }
            Ok::<_, StorageError>((orders, positions))
        },
    )?;
    Ok(orders)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, sku: i64, count: i64) -> OrderRow {
        OrderRow {
            id,
            user_id: 42,
            state: "AWAITING_PAYMENT".to_owned(),
            sku,
            count,
        }
    }

    #[test]
    fn rows_group_into_orders_in_first_seen_order() {
        let orders = group_order_rows(
            vec![row(2000, 1, 1), row(1000, 5, 2), row(2000, 2, 3)],
            Operation::ListOrders,
        )
        .expect("valid rows");

        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].id.into_inner(), 2000);
        let skus: Vec<u32> = orders[0].items.iter().map(|item| item.sku.into_inner()).collect();
        assert_eq!(skus, vec![1, 2]);
        assert_eq!(orders[1].items.len(), 1);
        assert_eq!(orders[1].state, OrderState::AwaitingPayment);
    }

    #[test]
    fn no_rows_means_no_orders() {
        assert!(group_order_rows(Vec::new(), Operation::ReadOrder).expect("empty").is_empty());
    }

    #[test]
    fn unknown_state_is_a_corrupt_row() {
        let mut bad = row(1000, 1, 1);
        bad.state = "SHIPPED".to_owned();
        let result = group_order_rows(vec![bad], Operation::ReadOrder);
        assert!(matches!(result, Err(StorageError::Corrupt { operation: Operation::ReadOrder, .. })));
    }

    #[test]
    fn out_of_range_counts_are_corrupt_rows() {
        assert!(group_order_rows(vec![row(1000, 1, 0)], Operation::ReadOrder).is_err());
        assert!(group_order_rows(vec![row(1000, -1, 1)], Operation::ReadOrder).is_err());
        let stock = StockRow {
            sku: 1,
            total_count: i64::from(u32::MAX) + 1,
            reserved: 0,
        };
        assert!(stock.into_stock(Operation::ReadStocks).is_err());
    }
}
