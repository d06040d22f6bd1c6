//! Identifier and quantity types shared by every LOMS component.
//!
//! All validated types use smart constructors so that an `OrderId` or an
//! `ItemCount` that exists is already known to be well formed. Wire values
//! arrive as 64-bit integers and are narrowed explicitly through the helpers
//! at the bottom of this module.

use nutype::nutype;

use crate::errors::LomsError;

/// Order ids encode their home shard in the lowest three decimal digits.
pub const ORDER_ID_SHARD_STRIDE: i64 = 1000;

/// Upper bound on the number of shards a router may hold.
pub const MAX_SHARDS: usize = 1000;

/// Stock keeping unit identifier.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct Sku(u32);

/// Number of units of one SKU on an order line. Always positive.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct ItemCount(u32);

/// Identifier of the customer placing an order. Always positive.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct UserId(i64);

/// Identifier of a persisted order.
///
/// Ids are allocated per shard as `sequence * ORDER_ID_SHARD_STRIDE + shard`,
/// so the owning shard can be recovered from the id alone.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct OrderId(i64);

impl OrderId {
    /// Builds the id for the `sequence`-th order allocated on `shard`.
    pub fn compose(sequence: i64, shard: ShardIndex) -> Result<Self, LomsError> {
        let shard = i64::try_from(shard.into_inner())
            .ok()
            .filter(|index| *index < ORDER_ID_SHARD_STRIDE)
            .ok_or_else(|| LomsError::InvalidInput(format!("shard index {shard} out of range")))?;
        let raw = sequence
            .checked_mul(ORDER_ID_SHARD_STRIDE)
            .and_then(|base| base.checked_add(shard))
            .ok_or_else(|| LomsError::InvalidInput(format!("order sequence {sequence} overflows")))?;
        Self::try_new(raw).map_err(|error| LomsError::InvalidInput(error.to_string()))
    }

    /// Shard that owns this order.
    pub fn shard(self) -> ShardIndex {
        // remainder of a positive id is always in 0..ORDER_ID_SHARD_STRIDE
        let index = usize::try_from(self.into_inner() % ORDER_ID_SHARD_STRIDE).unwrap_or_default();
        ShardIndex::new(index)
    }
}

/// Identifier of a row in a shard's outbox table.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct OutboxEventId(i64);

/// Position of a shard inside the router.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Into,
    Serialize,
    Deserialize
))]
pub struct ShardIndex(usize);

impl ShardIndex {
    /// The shard that holds inventory.
    pub fn default_shard() -> Self {
        Self::new(0)
    }
}

/// Narrows a wire integer to `u32`, failing with invalid input if it does not fit.
pub fn narrow_u32(field: &'static str, value: u64) -> Result<u32, LomsError> {
    u32::try_from(value)
        .map_err(|_| LomsError::InvalidInput(format!("{field} value {value} does not fit in 32 bits")))
}

/// Widens a stored count back to its wire form.
pub fn widen_u32(value: u32) -> u64 {
    u64::from(value)
}

/// Parses a wire SKU.
pub fn sku_from_wire(value: u64) -> Result<Sku, LomsError> {
    narrow_u32("sku", value).map(Sku::new)
}

/// Parses a wire item count, rejecting zero.
pub fn count_from_wire(value: u64) -> Result<ItemCount, LomsError> {
    let count = narrow_u32("count", value)?;
    ItemCount::try_new(count).map_err(|error| LomsError::InvalidInput(format!("count: {error}")))
}

/// Parses a wire user id, rejecting non-positive values.
pub fn user_from_wire(value: i64) -> Result<UserId, LomsError> {
    UserId::try_new(value).map_err(|error| LomsError::InvalidInput(format!("user: {error}")))
}

/// Parses a wire order id, rejecting non-positive values.
pub fn order_from_wire(value: i64) -> Result<OrderId, LomsError> {
    OrderId::try_new(value).map_err(|error| LomsError::InvalidInput(format!("order_id: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn order_id_recovers_its_shard() {
        let id = OrderId::compose(42, ShardIndex::new(7)).expect("valid id");
        assert_eq!(id.into_inner(), 42_007);
        assert_eq!(id.shard(), ShardIndex::new(7));
    }

    #[test]
    fn order_id_rejects_shard_outside_stride() {
        let result = OrderId::compose(1, ShardIndex::new(1000));
        assert!(matches!(result, Err(LomsError::InvalidInput(_))));
    }

    #[test]
    fn order_id_rejects_sequence_overflow() {
        let result = OrderId::compose(i64::MAX, ShardIndex::new(0));
        assert!(matches!(result, Err(LomsError::InvalidInput(_))));
    }

    #[test]
    fn zero_count_is_rejected() {
        assert!(ItemCount::try_new(0).is_err());
        assert!(matches!(count_from_wire(0), Err(LomsError::InvalidInput(_))));
    }

    #[test]
    fn wide_sku_is_rejected() {
        let result = sku_from_wire(u64::from(u32::MAX) + 1);
        assert!(matches!(result, Err(LomsError::InvalidInput(_))));
        assert_eq!(sku_from_wire(1002).expect("fits").into_inner(), 1002);
    }

    #[test]
    fn non_positive_identifiers_are_rejected() {
        assert!(user_from_wire(0).is_err());
        assert!(user_from_wire(-3).is_err());
        assert!(order_from_wire(0).is_err());
        assert_eq!(order_from_wire(5001).expect("positive").shard(), ShardIndex::new(1));
    }

    proptest! {
        #[test]
        fn composed_ids_route_back_to_their_shard(sequence in 1_i64..1_000_000_000, shard in 0_usize..1000) {
            let id = OrderId::compose(sequence, ShardIndex::new(shard)).expect("in range");
            prop_assert_eq!(id.shard(), ShardIndex::new(shard));
        }

        #[test]
        fn narrowing_accepts_exactly_the_u32_range(value in any::<u64>()) {
            let narrowed = narrow_u32("sku", value);
            prop_assert_eq!(narrowed.is_ok(), value <= u64::from(u32::MAX));
        }
    }
}
